use std::{env, time::Duration};

use actix_web::{
  delete, get,
  http::StatusCode,
  put,
  web::{self, Data},
  App, HttpResponse, HttpServer, ResponseError, Scope,
};
use bytes::Bytes;
use log::info;
use mux_kv::{option::DEFAULT_DIR_PATH, Context, Errors, PutOptions, Store};
use serde::{Deserialize, Serialize};

const LIST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
struct ApiError(Errors);

impl std::fmt::Display for ApiError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

impl ResponseError for ApiError {
  fn status_code(&self) -> StatusCode {
    match self.0 {
      Errors::KeyNotFound(_) => StatusCode::NOT_FOUND,
      Errors::KeyExists(_) => StatusCode::CONFLICT,
      Errors::DatabaseClosed => StatusCode::SERVICE_UNAVAILABLE,
      Errors::InvalidScopeName(_) | Errors::KeyIsEmpty => StatusCode::BAD_REQUEST,
      _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }
}

impl From<Errors> for ApiError {
  fn from(e: Errors) -> Self {
    ApiError(e)
  }
}

type ApiResult = Result<HttpResponse, ApiError>;

// Store calls touch the disk, so they run on the blocking pool.
async fn blocking<T, F>(f: F) -> Result<T, ApiError>
where
  F: FnOnce() -> mux_kv::Result<T> + Send + 'static,
  T: Send + 'static,
{
  match web::block(f).await {
    Ok(res) => res.map_err(ApiError),
    Err(_) => Err(ApiError(Errors::DatabaseClosed)),
  }
}

#[derive(Deserialize)]
struct PutQuery {
  #[serde(default)]
  replace: bool,
}

#[put("/{keyspace}/{key}")]
async fn put_handler(
  store: Data<Store>,
  path: web::Path<(String, String)>,
  query: web::Query<PutQuery>,
  body: web::Bytes,
) -> ApiResult {
  let (keyspace, key) = path.into_inner();
  let kv = store.keyspace(&keyspace)?;
  let opts = PutOptions {
    key: Bytes::from(key),
    data: body,
    replace: query.replace,
  };
  blocking(move || kv.put(opts)).await?;
  Ok(HttpResponse::Ok().finish())
}

#[get("/{keyspace}/{key}")]
async fn get_handler(store: Data<Store>, path: web::Path<(String, String)>) -> ApiResult {
  let (keyspace, key) = path.into_inner();
  let kv = store.keyspace(&keyspace)?;
  let value = blocking(move || kv.get(key.as_bytes())).await?;
  Ok(HttpResponse::Ok().content_type("application/octet-stream").body(value))
}

#[delete("/{keyspace}/{key}")]
async fn delete_handler(store: Data<Store>, path: web::Path<(String, String)>) -> ApiResult {
  let (keyspace, key) = path.into_inner();
  let kv = store.keyspace(&keyspace)?;
  blocking(move || kv.delete(key.as_bytes())).await?;
  Ok(HttpResponse::Ok().finish())
}

#[derive(Deserialize)]
struct ListQuery {
  #[serde(default)]
  start: String,
}

#[get("/{keyspace}/")]
async fn list_handler(
  store: Data<Store>,
  path: web::Path<String>,
  query: web::Query<ListQuery>,
) -> ApiResult {
  let kv = store.keyspace(&path.into_inner())?;
  let start = query.into_inner().start;
  let keys = blocking(move || {
    let ctx = Context::background().with_timeout(LIST_TIMEOUT);
    kv.list(&ctx, start.as_bytes())
      .map(|key| key.map(|k| String::from_utf8_lossy(&k).into_owned()))
      .collect::<mux_kv::Result<Vec<String>>>()
  })
  .await?;
  Ok(HttpResponse::Ok().json(keys))
}

#[derive(Serialize, Deserialize)]
struct LenResponse {
  len: u64,
}

#[get("/{keyspace}/len")]
async fn len_handler(store: Data<Store>, path: web::Path<String>) -> ApiResult {
  let kv = store.keyspace(&path.into_inner())?;
  let len = blocking(move || kv.len(&Context::background())).await?;
  Ok(HttpResponse::Ok().json(LenResponse { len }))
}

#[derive(Serialize, Deserialize)]
struct StatResponse {
  key_num: usize,
  data_file_num: usize,
  reclaim_size: u64,
  disk_size: u64,
}

#[get("/stat")]
async fn stat_handler(store: Data<Store>) -> ApiResult {
  // stat walks the data directory for its size
  let stat = blocking(move || store.monitor().db().stat()).await?;
  Ok(HttpResponse::Ok().json(StatResponse {
    key_num: stat.key_num,
    data_file_num: stat.data_file_num,
    reclaim_size: stat.reclaim_size,
    disk_size: stat.disk_size,
  }))
}

// `len` is registered ahead of the key routes, so a key named "len" cannot be read over GET.
fn routes() -> Scope {
  Scope::new("/mux-kv")
    .service(stat_handler)
    .service(len_handler)
    .service(list_handler)
    .service(put_handler)
    .service(get_handler)
    .service(delete_handler)
}

#[actix_web::main]
async fn main() -> std::io::Result<()> {
  env_logger::init();

  let addr =
    env::var("MUX_KV_ADDR").unwrap_or_else(|_| DEFAULT_DIR_PATH.to_string_lossy().into_owned());
  let listen = env::var("MUX_KV_LISTEN").unwrap_or_else(|_| "127.0.0.1:8080".to_string());
  let store = Store::open_address(&addr).map_err(std::io::Error::other)?;
  info!("serving {} on {}", addr, listen);

  let data = Data::new(store.clone());
  HttpServer::new(move || App::new().app_data(data.clone()).service(routes()))
    .bind(listen)?
    .run()
    .await?;

  store.close().map_err(std::io::Error::other)
}

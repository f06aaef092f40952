use bytes::Bytes;
use rand::{distr::Alphanumeric, Rng};

pub fn get_test_key(i: usize) -> Bytes {
  Bytes::from(format!("mux-kv-key-{:09}", i))
}

pub fn get_test_value(i: usize) -> Bytes {
  let suffix: String = rand::rng()
    .sample_iter(&Alphanumeric)
    .take(32)
    .map(char::from)
    .collect();
  Bytes::from(format!("mux-kv-value-{:09}-{}", i, suffix))
}

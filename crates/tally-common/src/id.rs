use rand::Rng;

/// Generates a 16-character hex batch id (8 random bytes).
pub fn next_batch_id() -> String {
    let bytes: [u8; 8] = rand::thread_rng().gen();
    hex::encode(bytes)
}

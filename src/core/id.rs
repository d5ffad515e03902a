use rand::Rng;

/// Length of a container ID in hex characters.
const ID_LEN: usize = 8;

/// Generate a random container ID (8 lowercase hex chars = 4 random bytes).
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    let bytes: Vec<u8> = (0..ID_LEN / 2).map(|_| rng.gen()).collect();
    hex_encode(&bytes)
}

/// Encode bytes as a lowercase hex string.
fn hex_encode(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{b:02x}"));
    }
    s
}

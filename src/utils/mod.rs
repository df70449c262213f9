pub mod response;

use rand::RngCore;

/// Placeholder settlement hash stored on orders and trades. Opaque to the
/// trading core; real settlement is an external concern.
pub fn mock_tx_hash() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    format!("0x{}", hex::encode(bytes))
}

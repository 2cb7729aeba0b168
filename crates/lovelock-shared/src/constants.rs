/// Application name
pub const APP_NAME: &str = "Love Lock";

/// Title used for desktop notifications of incoming messages
pub const NOTIFICATION_TITLE: &str = "💌 Love Lock";

/// Application-wide PBKDF2 salt. Changing it breaks every existing conversation.
pub const KDF_SALT: &[u8] = b"love-lock-salt";

/// PBKDF2-HMAC-SHA256 iteration count used by deployed clients
pub const PBKDF2_ITERATIONS: u32 = 250_000;

/// Lowest iteration count accepted outside of tests
pub const MIN_PBKDF2_ITERATIONS: u32 = 100_000;

/// AES-256-GCM key size in bytes
pub const SHARED_KEY_SIZE: usize = 32;

/// AES-GCM IV size in bytes (96 bits)
pub const IV_SIZE: usize = 12;

/// AES-GCM authentication tag size in bytes
pub const TAG_SIZE: usize = 16;

/// Separator between the base64 IV and the base64 ciphertext in an envelope
pub const ENVELOPE_DELIMITER: char = ':';

/// Body shown in place of a message that could not be decrypted
pub const DECRYPT_PLACEHOLDER: &str = "❌ Failed to decrypt";

// Types, key derivation and envelope codec shared by every Love Lock crate.

pub mod constants;
pub mod envelope;
pub mod error;
pub mod kdf;
pub mod message;
pub mod types;

pub use envelope::Envelope;
pub use kdf::{derive_shared_key, KeyCache, KeyDeriver, SharedKey};
pub use message::{decrypt_batch, ChatMessage, DeliveryStatus, NewMessage, RawMessageRow, StoredMessage};
pub use types::{MessageId, Pairing, ParticipantId};

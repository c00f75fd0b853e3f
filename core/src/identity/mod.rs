// Identity: long-term signing keys, signed prekey and their storage

mod keys;
mod store;

pub use keys::{IdentityKeys, PreKeyBundle};
pub use store::IdentityStore;

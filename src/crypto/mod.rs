pub mod ocb2;

pub use ocb2::{CryptStateOcb2, DecryptError, KeyLengthError};

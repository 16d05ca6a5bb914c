mod error;
mod term_store;

pub use self::error::StorageError;
pub use self::term_store::{ErrorSink, TermPersister, TermStore};

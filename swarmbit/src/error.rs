use thiserror::Error;

use crate::{InfoError, StoreError, TallyError};

/// Errors returned while starting a torrent.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Tally(#[from] TallyError),

    #[error(transparent)]
    Info(#[from] InfoError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

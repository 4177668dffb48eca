//! Error types for dialog-core

use lws_infra_common::errors::{
    ErrorCode, LWS_ERR_INVALID_PARAM, LWS_ERR_INVALID_STATE, LWS_ERR_SIP_AUTH,
    LWS_ERR_SIP_CANCEL_REJECTED, LWS_ERR_SIP_DIALOG, LWS_ERR_SIP_NO_DIALOG,
    LWS_ERR_SIP_TRANSACTION,
};
use thiserror::Error;

use crate::dialog::DialogId;
use crate::transaction::{TransactionKey, TransactionState};

/// Result type for dialog-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised by the transaction and dialog layer
#[derive(Error, Debug)]
pub enum Error {
    /// Message construction or parsing failed
    #[error("SIP error: {0}")]
    Sip(#[from] lws_sip_core::Error),

    /// No transaction with this key
    #[error("Transaction not found: {0}")]
    TransactionNotFound(TransactionKey),

    /// The operation does not fit the transaction's current state
    #[error("Transaction {key} is {state:?}: {reason}")]
    InvalidTransactionState {
        key: TransactionKey,
        state: TransactionState,
        reason: &'static str,
    },

    /// CANCEL is only legal while the INVITE is Calling or Proceeding
    #[error("Cannot cancel {key} in state {state:?}")]
    CancelRejected {
        key: TransactionKey,
        state: TransactionState,
    },

    /// No dialog with this id
    #[error("Dialog not found: {0}")]
    DialogNotFound(DialogId),

    /// A dialog with the same key already exists
    #[error("Dialog key collision: {0}")]
    DialogCollision(DialogId),

    /// A message lacks what a dialog needs (tags, Contact, ...)
    #[error("Cannot create dialog: {0}")]
    DialogCreation(String),

    /// Challenge could not be answered
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Timer wheel refused the timer
    #[error("Timer error: {0}")]
    Timer(#[from] lws_infra_common::Error),

    /// Invalid argument
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl Error {
    /// Status code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            Error::Sip(e) => e.code(),
            Error::TransactionNotFound(_) | Error::InvalidTransactionState { .. } => {
                LWS_ERR_SIP_TRANSACTION
            }
            Error::CancelRejected { .. } => LWS_ERR_SIP_CANCEL_REJECTED,
            Error::DialogNotFound(_) => LWS_ERR_SIP_NO_DIALOG,
            Error::DialogCollision(_) | Error::DialogCreation(_) => LWS_ERR_SIP_DIALOG,
            Error::Auth(_) => LWS_ERR_SIP_AUTH,
            Error::Timer(_) => LWS_ERR_INVALID_STATE,
            Error::InvalidInput(_) => LWS_ERR_INVALID_PARAM,
        }
    }
}

//! Serializable `{data, error}` pair handed to UI consumers.

use crate::error::GatewayError;
use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize};

/// Either data or an error message, never both.
///
/// Fields are private so the invariant holds; build one with [`Outcome::data`],
/// [`Outcome::error`], [`Outcome::empty`] or from a gateway result.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Outcome<T> {
    data: Option<T>,
    error: Option<String>,
}

impl<T> Outcome<T> {
    pub fn data(data: T) -> Self {
        Self {
            data: Some(data),
            error: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            data: None,
            error: Some(message.into()),
        }
    }

    /// Neither data nor error; the state before anything resolved.
    pub fn empty() -> Self {
        Self {
            data: None,
            error: None,
        }
    }

    pub fn get_data(&self) -> Option<&T> {
        self.data.as_ref()
    }

    pub fn get_error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn into_data(self) -> Option<T> {
        self.data
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

impl<T> From<Result<T, GatewayError>> for Outcome<T> {
    fn from(result: Result<T, GatewayError>) -> Self {
        match result {
            Ok(data) => Self::data(data),
            Err(err) => Self::error(err.to_string()),
        }
    }
}

impl<'de, T: Deserialize<'de>> Deserialize<'de> for Outcome<T> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        struct Raw<T> {
            data: Option<T>,
            error: Option<String>,
        }

        let raw = Raw::<T>::deserialize(deserializer)?;
        if raw.data.is_some() && raw.error.is_some() {
            return Err(D::Error::custom("outcome carries both data and error"));
        }
        Ok(Self {
            data: raw.data,
            error: raw.error,
        })
    }
}

/// Result of a write, shaped for consumers.
pub type MutationResult<T> = Outcome<T>;

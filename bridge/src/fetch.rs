use std::{sync::Arc, time::Duration};

use thiserror::Error;
use tracing::debug;

use crate::session::Transport;

// Settings sub-page that embeds the registered device list. Visiting it puts
// the device UI into setting mode.
pub const SETTINGS_PAGE_PATH: &str = "/page/setting/basic/72i41?page=72i4&request_by_form=1";
pub const HOME_PAGE_PATH: &str = "/page/myhome/9";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchError {
    #[error("request timed out")]
    Timeout,
    #[error("connection failed: {0}")]
    ConnectionFailure(String),
    #[error("device answered with HTTP {code}")]
    HttpStatus { code: u16 },
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else if let Some(status) = err.status() {
            Self::HttpStatus {
                code: status.as_u16(),
            }
        } else {
            Self::ConnectionFailure(err.to_string())
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    pub status: u16,
    pub body: String,
}

impl Page {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

pub struct PageFetcher<T> {
    transport: Arc<T>,
    timeout: Duration,
}

impl<T: Transport> PageFetcher<T> {
    pub fn new(transport: Arc<T>, timeout: Duration) -> Self {
        Self { transport, timeout }
    }

    pub async fn fetch(&self, path: &str) -> Result<Page, FetchError> {
        debug!(path, timeout_ms = self.timeout.as_millis() as u64, "fetching device page");
        let page = self.transport.get(path, self.timeout).await?;
        if !page.is_success() {
            return Err(FetchError::HttpStatus { code: page.status });
        }
        Ok(page)
    }
}

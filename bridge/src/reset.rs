use std::{sync::Arc, time::Duration};

use tracing::{debug, warn};

use crate::{
    fetch::{FetchError, PageFetcher, HOME_PAGE_PATH},
    session::Transport,
};

pub struct ModeReset<T> {
    fetcher: PageFetcher<T>,
    grace: Duration,
}

impl<T: Transport> ModeReset<T> {
    pub fn new(transport: Arc<T>, grace: Duration, timeout: Duration) -> Self {
        Self {
            fetcher: PageFetcher::new(transport, timeout),
            grace,
        }
    }

    pub async fn run(&self) {
        tokio::time::sleep(self.grace).await;

        match self.fetcher.fetch(HOME_PAGE_PATH).await {
            Ok(_) => debug!("released device from setting mode"),
            Err(FetchError::Timeout) => warn!("setting mode release timed out (ignored)"),
            Err(err) => warn!("setting mode release failed (ignored): {err}"),
        }
    }
}

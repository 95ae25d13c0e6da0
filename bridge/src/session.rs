use std::{future::Future, time::Duration};

use digest_auth::{AuthContext, WwwAuthenticateHeader};
use reqwest::{header, Client, Response, StatusCode};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use aiseg_common::DeviceConfig;

use crate::fetch::{FetchError, Page};

// The HTTP capability the rest of the bridge talks to the device through.
// Implementations report transport failures only; status codes are returned
// as-is for the caller to classify.
pub trait Transport: Send + Sync + 'static {
    fn get(
        &self,
        path: &str,
        timeout: Duration,
    ) -> impl Future<Output = Result<Page, FetchError>> + Send;

    fn close(&self) -> impl Future<Output = ()> + Send;
}

pub struct DigestSession {
    base_url: String,
    username: String,
    password: String,
    default_timeout: Duration,
    user_agent: String,
    client: Mutex<Option<Client>>,
    challenge: Mutex<Option<WwwAuthenticateHeader>>,
}

impl DigestSession {
    pub fn new(config: &DeviceConfig) -> Self {
        Self {
            base_url: config.base_url(),
            username: config.username.clone(),
            password: config.password.clone(),
            default_timeout: config.fetch_timeout(),
            user_agent: config.user_agent.clone(),
            client: Mutex::new(None),
            challenge: Mutex::new(None),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    #[cfg(test)]
    pub async fn is_open(&self) -> bool {
        self.client.lock().await.is_some()
    }

    async fn client(&self) -> Result<Client, FetchError> {
        let mut slot = self.client.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let client = Client::builder()
            .timeout(self.default_timeout)
            .user_agent(self.user_agent.as_str())
            .build()
            .map_err(|err| FetchError::ConnectionFailure(format!("http client setup: {err}")))?;
        debug!(base_url = %self.base_url, "opened device session");

        *slot = Some(client.clone());
        Ok(client)
    }

    fn authorization(&self, challenge: &mut WwwAuthenticateHeader, path: &str) -> Option<String> {
        let context = AuthContext::new(self.username.as_str(), self.password.as_str(), path);
        match challenge.respond(&context) {
            Ok(answer) => Some(answer.to_header_string()),
            Err(err) => {
                warn!("cannot answer digest challenge: {err}");
                None
            }
        }
    }

    async fn send(
        &self,
        client: &Client,
        path: &str,
        timeout: Duration,
        authorization: Option<String>,
    ) -> Result<Response, FetchError> {
        let mut request = client
            .get(format!("{}{}", self.base_url, path))
            .timeout(timeout);
        if let Some(value) = authorization {
            request = request.header(header::AUTHORIZATION, value);
        }
        Ok(request.send().await?)
    }
}

impl Transport for DigestSession {
    async fn get(&self, path: &str, timeout: Duration) -> Result<Page, FetchError> {
        let client = self.client().await?;
        let mut challenge = self.challenge.lock().await;

        // Answer the cached challenge up front; the device only re-challenges
        // once its nonce goes stale.
        let cached = challenge
            .as_mut()
            .and_then(|cached| self.authorization(cached, path));
        let mut response = self.send(&client, path, timeout, cached).await?;

        if response.status() == StatusCode::UNAUTHORIZED {
            if let Some(fresh) = digest_challenge(&response) {
                let fresh = challenge.insert(fresh);
                if let Some(answer) = self.authorization(fresh, path) {
                    debug!(path, "answering digest challenge");
                    response = self.send(&client, path, timeout, Some(answer)).await?;
                }
            } else {
                warn!(path, "device rejected request without a digest challenge");
            }
        }

        let status = response.status().as_u16();
        let body = response.text().await?;
        Ok(Page { status, body })
    }

    async fn close(&self) {
        let client = self.client.lock().await.take();
        self.challenge.lock().await.take();
        if client.is_some() {
            debug!(base_url = %self.base_url, "closed device session");
        }
    }
}

fn digest_challenge(response: &Response) -> Option<WwwAuthenticateHeader> {
    response
        .headers()
        .get_all(header::WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .find_map(|value| digest_auth::parse(value).ok())
}

#[cfg(test)]
pub mod testing {
    use std::{
        collections::VecDeque,
        sync::{
            atomic::{AtomicBool, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use super::Transport;
    use crate::fetch::{FetchError, Page};

    // `None` in the queue is a request the device never answers.
    #[derive(Default)]
    pub struct ScriptedTransport {
        answers: Mutex<VecDeque<Option<Result<Page, FetchError>>>>,
        calls: Mutex<Vec<(String, Duration)>>,
        closed: AtomicBool,
    }

    impl ScriptedTransport {
        pub fn push_page(&self, status: u16, body: impl Into<String>) {
            self.push(Ok(Page {
                status,
                body: body.into(),
            }));
        }

        pub fn push(&self, answer: Result<Page, FetchError>) {
            self.answers.lock().unwrap().push_back(Some(answer));
        }

        pub fn push_hang(&self) {
            self.answers.lock().unwrap().push_back(None);
        }

        pub fn calls(&self) -> Vec<String> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(path, _)| path.clone())
                .collect()
        }

        pub fn timeouts(&self) -> Vec<Duration> {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .map(|(_, timeout)| *timeout)
                .collect()
        }

        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
    }

    impl Transport for ScriptedTransport {
        async fn get(&self, path: &str, timeout: Duration) -> Result<Page, FetchError> {
            self.calls.lock().unwrap().push((path.to_string(), timeout));
            let next = self.answers.lock().unwrap().pop_front();
            match next {
                Some(Some(answer)) => answer,
                Some(None) => std::future::pending().await,
                None => Err(FetchError::ConnectionFailure("no scripted answer".into())),
            }
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }
}

// HTTP proxy for a load path controller owned by another process
//
// Watchers registered here stay local. The owner is told where to call back,
// and verdicts it posts to the notify endpoint are handed to the local watcher.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::controller::{ControllerPolicy, IntervalResultWatcher, LoadPathController};
use crate::error::Result;
use crate::messages::{IntervalResultMessage, RegisterWatcherMessage};
use crate::transport::PeerClient;

pub fn register_path(run_name: &str) -> String {
    format!("/loadPathController/run/{}/register", run_name)
}

pub fn remove_path(run_name: &str) -> String {
    format!("/loadPathController/run/{}/remove", run_name)
}

pub fn result_path(run_name: &str) -> String {
    format!("/loadPathController/run/{}/result", run_name)
}

pub fn notify_path(run_name: &str, load_path_name: &str) -> String {
    format!(
        "/loadPathController/run/{}/loadPath/{}/notify",
        run_name, load_path_name
    )
}

pub struct RemoteLoadPathController {
    client: PeerClient,
    run_name: String,
    owner_host: String,
    self_host: String,
    policy: ControllerPolicy,
    watchers: Mutex<HashMap<String, Arc<dyn IntervalResultWatcher>>>,
}

impl RemoteLoadPathController {
    /// `self_host` is how the owner reaches this process ("name" or "name:port")
    pub fn new(
        client: PeerClient,
        run_name: impl Into<String>,
        owner_host: impl Into<String>,
        self_host: impl Into<String>,
        policy: ControllerPolicy,
    ) -> Self {
        Self {
            client,
            run_name: run_name.into(),
            owner_host: owner_host.into(),
            self_host: self_host.into(),
            policy,
            watchers: Mutex::new(HashMap::new()),
        }
    }

    /// Deliver a verdict the owner posted back to us
    pub async fn notify(&self, load_path_name: &str, interval_name: &str, passed: bool) {
        let watcher = self.watchers.lock().get(load_path_name).cloned();
        match watcher {
            Some(watcher) => watcher.interval_result(interval_name, passed).await,
            None => warn!(
                load_path = %load_path_name,
                interval = %interval_name,
                "verdict for unknown local watcher"
            ),
        }
    }
}

#[async_trait]
impl LoadPathController for RemoteLoadPathController {
    async fn register_interval_result_callback(
        &self,
        name: &str,
        watcher: Arc<dyn IntervalResultWatcher>,
    ) -> Result<()> {
        self.watchers.lock().insert(name.to_string(), watcher);

        let msg = RegisterWatcherMessage {
            load_path_name: name.to_string(),
            callback_url: self
                .client
                .url(&self.self_host, &notify_path(&self.run_name, name)),
            policy: self.policy,
        };
        let url = self.client.url(&self.owner_host, &register_path(&self.run_name));
        debug!(load_path = %name, url = %url, "registering remote watcher");
        self.client.post(&url, &msg).await?;
        Ok(())
    }

    async fn remove_interval_result_callback(&self, name: &str) -> Result<()> {
        self.watchers.lock().remove(name);
        let msg = RegisterWatcherMessage {
            load_path_name: name.to_string(),
            callback_url: String::new(),
            policy: self.policy,
        };
        let url = self.client.url(&self.owner_host, &remove_path(&self.run_name));
        self.client.post(&url, &msg).await?;
        Ok(())
    }

    async fn post_interval_result(
        &self,
        name: &str,
        interval_name: &str,
        passed: bool,
    ) -> Result<()> {
        let msg = IntervalResultMessage {
            load_path_name: name.to_string(),
            interval_name: interval_name.to_string(),
            passed,
        };
        let url = self.client.url(&self.owner_host, &result_path(&self.run_name));
        self.client.post(&url, &msg).await?;
        Ok(())
    }
}

/// Owner-side watcher standing in for a remote participant
pub struct HttpWatcher {
    client: PeerClient,
    load_path_name: String,
    callback_url: String,
}

impl HttpWatcher {
    pub fn new(client: PeerClient, load_path_name: impl Into<String>, callback_url: impl Into<String>) -> Self {
        Self {
            client,
            load_path_name: load_path_name.into(),
            callback_url: callback_url.into(),
        }
    }
}

#[async_trait]
impl IntervalResultWatcher for HttpWatcher {
    async fn interval_result(&self, interval_name: &str, passed: bool) {
        let msg = IntervalResultMessage {
            load_path_name: self.load_path_name.clone(),
            interval_name: interval_name.to_string(),
            passed,
        };
        if let Err(e) = self.client.post(&self.callback_url, &msg).await {
            warn!(
                load_path = %self.load_path_name,
                interval = %interval_name,
                url = %self.callback_url,
                error = %e,
                "failed to deliver interval verdict"
            );
        }
    }
}

//! Queue-driven imports and deletes
//!
//! Long-running transfers are externalised as work-queue tasks so they
//! survive restarts. An import task checkpoints the index of the next
//! token after every token it finishes.

use super::Importer;
use crate::backoff::{Backoff, BackoffConfig};
use crate::meta::TokenStore;
use crate::nodes::NodeCollection;
use crate::queue::{Task, WorkQueue};
use crate::resolver::Resolver;
use crate::{Member, RelayError, Result, Token};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Payload of an import task
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportTask {
    pub tokens: Vec<Token>,
    /// Subset of `tokens` the importer takes over once everything is copied
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reassign: Vec<Token>,
    /// Only take over tokens still owned by this member
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reassign_from: Option<String>,
}

/// Payload of a delete task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteTask {
    pub token: Token,
}

/// Runs once per token after an import task has copied everything
#[async_trait]
pub trait ImportHook: Send + Sync {
    async fn after_import(&self, token: Token, task: &ImportTask) -> Result<()>;
}

/// Assigns a task's `reassign` tokens to the importing member
///
/// With `reassign_from` set a token moves only while that member still
/// owns it.
pub struct ReassignHook {
    tokens: Arc<TokenStore>,
    resolver: Arc<Resolver>,
    member: String,
}

impl ReassignHook {
    pub fn new(tokens: Arc<TokenStore>, resolver: Arc<Resolver>, member: impl Into<String>) -> Self {
        Self {
            tokens,
            resolver,
            member: member.into(),
        }
    }
}

#[async_trait]
impl ImportHook for ReassignHook {
    async fn after_import(&self, token: Token, task: &ImportTask) -> Result<()> {
        if !task.reassign.contains(&token) {
            return Ok(());
        }
        if let Some(from) = &task.reassign_from {
            if self.resolver.ring().owner(token).as_deref() != Some(from.as_str()) {
                debug!(token, from = %from, "token not owned by source, leaving assignment");
                return Ok(());
            }
        }
        self.tokens.assign(token, &self.member).await?;
        self.resolver.add_token(token, &self.member);
        Ok(())
    }
}

fn local_member(nodes: &NodeCollection, name: &str) -> Result<Member> {
    nodes
        .get(name)
        .ok_or_else(|| RelayError::NotFound(format!("node {} is not registered", name)))
}

async fn pause(backoff: &mut Backoff, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        _ = tokio::time::sleep(backoff.next_delay()) => true,
    }
}

/// Consumes this member's import queue
pub struct ReliableImporter {
    member: String,
    importer: Arc<Importer>,
    queue: Arc<WorkQueue<ImportTask>>,
    nodes: Arc<NodeCollection>,
    hook: Arc<dyn ImportHook>,
    backoff: BackoffConfig,
}

impl ReliableImporter {
    pub fn new(
        member: impl Into<String>,
        importer: Arc<Importer>,
        queue: Arc<WorkQueue<ImportTask>>,
        nodes: Arc<NodeCollection>,
        hook: Arc<dyn ImportHook>,
    ) -> Self {
        Self {
            member: member.into(),
            importer,
            queue,
            nodes,
            hook,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    /// Import, check in after every token, run the hook, then complete
    pub async fn process(&self, task: &mut Task<ImportTask>) -> Result<()> {
        let target = local_member(&self.nodes, &self.member)?;
        while let Some(token) = task.payload.tokens.get(task.checkpoint).copied() {
            self.importer.import_token(token, &target).await?;
            task.checkpoint += 1;
            self.queue.check_in(task).await?;
        }
        for token in &task.payload.tokens {
            self.hook.after_import(*token, &task.payload).await?;
        }
        self.queue.complete(task).await?;
        info!(node = %self.member, id = %task.id, tokens = task.payload.tokens.len(), "import task complete");
        Ok(())
    }

    /// Work the queue until `cancel` fires; failed tasks retry with back-off
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut subscription = match self.queue.subscribe(&self.member, &cancel).await {
            Ok(s) => s,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(mut task) = subscription.next(&cancel).await {
            let mut backoff = Backoff::new(self.backoff);
            loop {
                match self.process(&mut task).await {
                    Ok(()) => break,
                    Err(e) => {
                        warn!(node = %self.member, id = %task.id, checkpoint = task.checkpoint, error = %e, "import task failed");
                        if !pause(&mut backoff, &cancel).await {
                            return Ok(());
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

/// Consumes this member's delete queue
pub struct DeleteWorker {
    member: String,
    importer: Arc<Importer>,
    queue: Arc<WorkQueue<DeleteTask>>,
    nodes: Arc<NodeCollection>,
    backoff: BackoffConfig,
}

impl DeleteWorker {
    pub fn new(
        member: impl Into<String>,
        importer: Arc<Importer>,
        queue: Arc<WorkQueue<DeleteTask>>,
        nodes: Arc<NodeCollection>,
    ) -> Self {
        Self {
            member: member.into(),
            importer,
            queue,
            nodes,
            backoff: BackoffConfig::default(),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffConfig) -> Self {
        self.backoff = backoff;
        self
    }

    pub async fn process(&self, task: &Task<DeleteTask>) -> Result<()> {
        let member = local_member(&self.nodes, &self.member)?;
        self.importer.delete_by_token(&member, task.payload.token).await?;
        self.queue.complete(task).await
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        let mut subscription = match self.queue.subscribe(&self.member, &cancel).await {
            Ok(s) => s,
            Err(_) if cancel.is_cancelled() => return Ok(()),
            Err(e) => return Err(e),
        };
        while let Some(task) = subscription.next(&cancel).await {
            let mut backoff = Backoff::new(self.backoff);
            while let Err(e) = self.process(&task).await {
                warn!(node = %self.member, token = task.payload.token, error = %e, "delete task failed");
                if !pause(&mut backoff, &cancel).await {
                    return Ok(());
                }
            }
        }
        Ok(())
    }
}

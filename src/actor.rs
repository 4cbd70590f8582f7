//! A thin per-canister wrapper over the request engine.
//!
//! Argument encoding and decoding is the caller's concern (the Candid
//! value codec lives outside this crate); an [`Actor`] just routes typed
//! method calls into [`Agent::call`] and [`Agent::query`].

use crate::agent::{Agent, CallOptions, CallResult, QueryOptions};
use crate::error::AgentError;
use candid::Principal;
use std::sync::Arc;

#[derive(Clone)]
pub struct Actor {
    agent: Arc<Agent>,
    canister_id: Principal,
}

impl Actor {
    pub fn new(agent: Arc<Agent>, canister_id: Principal) -> Self {
        Actor { agent, canister_id }
    }

    pub fn canister_id(&self) -> Principal {
        self.canister_id
    }

    pub fn agent(&self) -> &Agent {
        &self.agent
    }

    /// Submits an update call to the canister.
    pub async fn update(
        &self,
        method_name: &str,
        arg: Vec<u8>,
        options: CallOptions,
    ) -> Result<CallResult, AgentError> {
        self.agent.call(self.canister_id, method_name, arg, options).await
    }

    /// Queries the canister and returns the reply blob.
    pub async fn query(
        &self,
        method_name: &str,
        arg: Vec<u8>,
        options: QueryOptions,
    ) -> Result<Vec<u8>, AgentError> {
        Ok(self.agent.query(self.canister_id, method_name, arg, options).await?.reply)
    }
}

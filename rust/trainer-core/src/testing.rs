// rust/trainer-core/src/testing.rs

//! Shared fixtures for the crate's unit tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::bridge::{Bridge, LocalBridge};
use crate::error::{Result, TrainerError};
use crate::graph::{Graph, NodeId, Tensor};
use crate::optimizer::Differentiator;
use crate::tensor::{DType, Data, Value};

/// Hands out the same gradient for every element, except for tensors
/// explicitly marked as not contributing to the loss.
#[derive(Clone)]
pub(crate) struct UniformGradients {
    value: f32,
    null_for: Vec<NodeId>,
}

impl UniformGradients {
    pub(crate) fn new(value: f32) -> Self {
        Self {
            value,
            null_for: Vec::new(),
        }
    }

    pub(crate) fn without(mut self, tensor: &Tensor) -> Self {
        self.null_for.push(tensor.id());
        self
    }
}

impl Differentiator for UniformGradients {
    fn gradients(
        &self,
        graph: &mut Graph,
        _loss: &Tensor,
        xs: &[Tensor],
    ) -> Result<Vec<Option<Tensor>>> {
        xs.iter()
            .map(|x| {
                if self.null_for.contains(&x.id()) {
                    return Ok(None);
                }
                let value = self.value;
                graph
                    .compute(&[x], DType::Float32, move |inputs| {
                        let shape = inputs[0].shape().to_vec();
                        let n = shape.iter().product();
                        Value::new(shape, Data::Float32(vec![value; n]))
                    })
                    .map(Some)
            })
            .collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect,
    Start(u64),
    Send(String),
    Receive(String),
    Commit,
    Terminate,
}

/// Bridge wrapper that records every call and can inject a start failure.
pub(crate) struct RecordingBridge {
    inner: LocalBridge,
    calls: Mutex<Vec<Call>>,
    fail_start_at: Option<u64>,
}

impl RecordingBridge {
    pub(crate) fn new(inner: LocalBridge) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_start_at: None,
        })
    }

    pub(crate) fn failing_start(inner: LocalBridge, iteration: u64) -> Arc<Self> {
        Arc::new(Self {
            inner,
            calls: Mutex::new(Vec::new()),
            fail_start_at: Some(iteration),
        })
    }

    pub(crate) fn pair() -> (Arc<Self>, Arc<Self>) {
        let (leader, follower) = LocalBridge::pair();
        (Self::new(leader), Self::new(follower))
    }

    pub(crate) fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub(crate) fn sent(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|c| match c {
                Call::Send(name) => Some(name),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl Bridge for RecordingBridge {
    async fn connect(&self) -> Result<()> {
        self.record(Call::Connect);
        self.inner.connect().await
    }

    async fn start(&self, iteration: u64) -> Result<()> {
        self.record(Call::Start(iteration));
        if self.fail_start_at == Some(iteration) {
            return Err(TrainerError::bridge("start", "injected failure"));
        }
        self.inner.start(iteration).await
    }

    async fn send(&self, name: &str, value: Value) -> Result<()> {
        self.record(Call::Send(name.to_string()));
        self.inner.send(name, value).await
    }

    async fn receive(&self, name: &str, dtype: DType) -> Result<Value> {
        self.record(Call::Receive(name.to_string()));
        self.inner.receive(name, dtype).await
    }

    async fn commit(&self) -> Result<()> {
        self.record(Call::Commit);
        self.inner.commit().await
    }

    async fn terminate(&self) -> Result<()> {
        self.record(Call::Terminate);
        self.inner.terminate().await
    }
}

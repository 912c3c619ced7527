// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Guarded access to long-lived, non-reentrant interpreter VMs.
//!
//! Every call into a VM, lifecycle calls included, goes through the
//! instance's mutex. Distinct instances never contend with each other.
//! Script code runs on the blocking pool, so a slow script only holds up
//! the workers waiting on its own instance.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, error, warn};

use crate::error::PluginError;

/// Which entry point of the script is called.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Request,
    Response,
}

impl Direction {
    pub fn entry_point(self) -> &'static str {
        match self {
            Direction::Request => "proxenet_request_hook",
            Direction::Response => "proxenet_response_hook",
        }
    }
}

/// A loaded script VM. `Ok(None)` means "leave the buffer as it is".
pub trait Interpreter: Send {
    fn call(
        &mut self,
        entry: Direction,
        request_id: u64,
        buffer: &[u8],
    ) -> anyhow::Result<Option<Vec<u8>>>;
}

/// A scripting language the proxy knows how to host.
pub trait InterpreterKind: Send + Sync {
    fn name(&self) -> &str;

    /// Script file extension, without the dot.
    fn extension(&self) -> &str;

    /// Build a fresh VM with `source` loaded. `script` is for diagnostics.
    fn spawn(&self, script: &Path, source: &str) -> anyhow::Result<Box<dyn Interpreter>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InstanceState {
    Uninitialized,
    Ready,
    /// Deactivated: no longer counted live, calls pass through.
    Retired,
    Destroyed,
}

struct Slot {
    state: InstanceState,
    vm: Option<Box<dyn Interpreter>>,
}

/// One script bound to one VM of its kind.
pub struct InterpreterInstance {
    name: String,
    priority: u8,
    script: PathBuf,
    kind: Arc<dyn InterpreterKind>,
    /// Ready instances of this kind, shared by all its instances.
    live: Arc<AtomicUsize>,
    guard: Arc<Mutex<Slot>>,
}

impl InterpreterInstance {
    pub fn new(
        name: impl Into<String>,
        priority: u8,
        script: impl Into<PathBuf>,
        kind: Arc<dyn InterpreterKind>,
        live: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            name: name.into(),
            priority,
            script: script.into(),
            kind,
            live,
            guard: Arc::new(Mutex::new(Slot {
                state: InstanceState::Uninitialized,
                vm: None,
            })),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn priority(&self) -> u8 {
        self.priority
    }

    pub fn kind_name(&self) -> &str {
        self.kind.name()
    }

    pub async fn state(&self) -> InstanceState {
        self.guard.lock().await.state
    }

    /// Load the script into a new VM. A second call on a ready instance is
    /// a no-op.
    pub async fn initialize(&self) -> Result<(), PluginError> {
        let mut slot = self.guard.lock().await;
        match slot.state {
            InstanceState::Ready => return Ok(()),
            InstanceState::Retired if slot.vm.is_some() => {}
            _ => {
                let source = tokio::fs::read_to_string(&self.script).await.map_err(|e| {
                    PluginError::Load {
                        path: self.script.display().to_string(),
                        reason: e.to_string(),
                    }
                })?;
                let vm = self
                    .kind
                    .spawn(&self.script, &source)
                    .map_err(|e| PluginError::Load {
                        path: self.script.display().to_string(),
                        reason: e.to_string(),
                    })?;
                slot.vm = Some(vm);
            }
        }
        slot.state = InstanceState::Ready;
        self.live.fetch_add(1, Ordering::SeqCst);
        debug!(plugin = %self.name, kind = self.kind.name(), "interpreter ready");
        Ok(())
    }

    /// Stop counting this instance as live. Later calls pass through.
    pub async fn retire(&self) {
        let mut slot = self.guard.lock().await;
        if slot.state == InstanceState::Ready {
            slot.state = InstanceState::Retired;
            self.live.fetch_sub(1, Ordering::SeqCst);
            debug!(plugin = %self.name, "interpreter retired");
        }
    }

    /// Tear the VM down. Refused while any instance of the same kind is
    /// still ready, this one included.
    pub async fn destroy(&self) -> Result<(), PluginError> {
        let mut slot = self.guard.lock().await;
        let live = self.live.load(Ordering::SeqCst);
        if live > 0 {
            return Err(PluginError::InstancesStillLive {
                kind: self.kind.name().to_string(),
                live,
            });
        }
        slot.vm = None;
        slot.state = InstanceState::Destroyed;
        debug!(plugin = %self.name, "interpreter destroyed");
        Ok(())
    }

    /// Run `buffer` through the entry point for `direction`.
    ///
    /// `None` means pass the original buffer through: the script declined to
    /// change it, the instance is not ready, or the script failed.
    pub async fn invoke(
        &self,
        request_id: u64,
        buffer: &[u8],
        direction: Direction,
    ) -> Option<Vec<u8>> {
        let mut slot = self.guard.clone().lock_owned().await;
        if slot.state != InstanceState::Ready {
            return None;
        }
        let input = buffer.to_vec();
        // The owned guard moves into the blocking task and is released when
        // the call returns, even if this future is dropped meanwhile.
        let call = tokio::task::spawn_blocking(move || {
            let vm = slot.vm.as_mut()?;
            Some(catch_unwind(AssertUnwindSafe(|| {
                vm.call(direction, request_id, &input)
            })))
        });
        match call.await {
            Ok(None) => None,
            Ok(Some(Ok(Ok(out)))) => out,
            Ok(Some(Ok(Err(e)))) => {
                warn!(
                    plugin = %self.name,
                    entry = direction.entry_point(),
                    request_id,
                    %e,
                    "plugin call failed, passing buffer through"
                );
                None
            }
            Ok(Some(Err(_))) => {
                error!(
                    plugin = %self.name,
                    entry = direction.entry_point(),
                    request_id,
                    "plugin panicked, passing buffer through"
                );
                None
            }
            Err(e) => {
                error!(plugin = %self.name, request_id, %e, "plugin task failed");
                None
            }
        }
    }
}

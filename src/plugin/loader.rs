// SPDX-FileCopyrightText: 2025 Alexandre Gomes Gaigalas <alganet@gmail.com>
//
// SPDX-License-Identifier: ISC

//! Plugin discovery and the ordered chain buffers flow through.

use bytes::BytesMut;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{info, trace, warn};

use super::interpreter::{Direction, InterpreterInstance, InterpreterKind};
use super::substitute::Substitute;
use crate::error::PluginError;

const DEFAULT_PRIORITY: u8 = 9;

struct RegisteredKind {
    kind: Arc<dyn InterpreterKind>,
    live: Arc<AtomicUsize>,
}

/// Interpreter kinds available to plugins, each with its live counter.
#[derive(Default)]
pub struct InterpreterRegistry {
    kinds: Vec<RegisteredKind>,
}

impl InterpreterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_builtin_kinds() -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Substitute));
        registry
    }

    pub fn register(&mut self, kind: Arc<dyn InterpreterKind>) {
        self.kinds.push(RegisteredKind {
            kind,
            live: Arc::new(AtomicUsize::new(0)),
        });
    }

    fn by_name(&self, name: &str) -> Option<&RegisteredKind> {
        self.kinds.iter().find(|k| k.kind.name() == name)
    }

    fn by_extension(&self, ext: &str) -> Option<&RegisteredKind> {
        self.kinds.iter().find(|k| k.kind.extension() == ext)
    }

    /// Ready instances of kind `name`.
    pub fn live_count(&self, name: &str) -> usize {
        self.by_name(name)
            .map(|k| k.live.load(Ordering::SeqCst))
            .unwrap_or(0)
    }

    /// New, uninitialized instance of kind `kind_name` bound to `script`.
    pub fn instance(
        &self,
        kind_name: &str,
        name: &str,
        priority: u8,
        script: &Path,
    ) -> Result<InterpreterInstance, PluginError> {
        let registered = self
            .by_name(kind_name)
            .ok_or_else(|| PluginError::UnknownKind(kind_name.to_string()))?;
        Ok(InterpreterInstance::new(
            name,
            priority,
            script,
            registered.kind.clone(),
            registered.live.clone(),
        ))
    }
}

/// Split `1AddHeader.sub` into priority 1, name `AddHeader`, extension `sub`.
pub fn parse_plugin_filename(file_name: &str) -> Option<(u8, &str, &str)> {
    if file_name.starts_with('.') {
        return None;
    }
    let (stem, ext) = file_name.rsplit_once('.')?;
    let digits = stem.bytes().take_while(|b| b.is_ascii_digit()).count();
    let (prio, name) = stem.split_at(digits);
    if name.is_empty() || ext.is_empty() {
        return None;
    }
    let priority = prio.parse::<u8>().unwrap_or(DEFAULT_PRIORITY);
    Some((priority, name, ext))
}

/// Plugins in the order they see each buffer.
#[derive(Default, Clone)]
pub struct PluginChain {
    instances: Vec<Arc<InterpreterInstance>>,
}

impl PluginChain {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Sorted by ascending priority, then name.
    pub fn from_instances(mut instances: Vec<Arc<InterpreterInstance>>) -> Self {
        instances.sort_by(|a, b| {
            a.priority()
                .cmp(&b.priority())
                .then_with(|| a.name().cmp(b.name()))
        });
        Self { instances }
    }

    /// Load and initialize every recognised script in `dir`. Scripts that
    /// fail to load are logged and skipped.
    pub async fn load_dir(dir: &Path, registry: &InterpreterRegistry) -> anyhow::Result<Self> {
        let mut entries = tokio::fs::read_dir(dir).await?;
        let mut instances = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            if !entry.file_type().await?.is_file() {
                continue;
            }
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((priority, name, ext)) = parse_plugin_filename(file_name) else {
                continue;
            };
            let Some(kind) = registry.by_extension(ext) else {
                trace!(%file_name, "no interpreter for extension");
                continue;
            };
            let instance = registry.instance(kind.kind.name(), name, priority, &entry.path())?;
            match instance.initialize().await {
                Ok(()) => {
                    info!(plugin = name, priority, kind = kind.kind.name(), "plugin loaded");
                    instances.push(Arc::new(instance));
                }
                Err(e) => warn!(%e, "plugin not loaded"),
            }
        }
        Ok(Self::from_instances(instances))
    }

    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    pub fn instances(&self) -> &[Arc<InterpreterInstance>] {
        &self.instances
    }

    /// Pass `buffer` through every plugin. A plugin's output is the next
    /// plugin's input; "no change" keeps the current buffer.
    pub async fn apply(&self, request_id: u64, mut buffer: BytesMut, direction: Direction) -> BytesMut {
        for instance in &self.instances {
            if let Some(out) = instance.invoke(request_id, &buffer, direction).await {
                trace!(
                    plugin = instance.name(),
                    request_id,
                    before = buffer.len(),
                    after = out.len(),
                    "buffer transformed"
                );
                buffer = BytesMut::from(&out[..]);
            }
        }
        buffer
    }

    /// Retire every instance, then tear the VMs down.
    pub async fn shutdown(&self) {
        for instance in &self.instances {
            instance.retire().await;
        }
        for instance in &self.instances {
            if let Err(e) = instance.destroy().await {
                warn!(plugin = instance.name(), %e, "interpreter not destroyed");
            }
        }
    }
}

//! Accessor program cache
//!
//! Programs are cached by (module build identity, function address) and
//! shared across every object of the owning type — and across concurrent
//! traversals, so the map is append-only behind a lock. Failed lifts are
//! cached too: one unsupported instruction must not trigger a re-lift per
//! object.

use crate::decode::AccessorLifter;
use crate::error::LiftError;
use crate::program::AccessorProgram;
use coregraph_descriptors::{BuildId, FunctionDescriptor};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;

/// Cache key: module build identity plus link-time function address.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessorKey {
    pub build_id: BuildId,
    pub address: u64,
}

impl AccessorKey {
    pub fn new(build_id: &BuildId, address: u64) -> Self {
        Self {
            build_id: build_id.clone(),
            address,
        }
    }
}

enum CachedLift {
    Program(Arc<AccessorProgram>),
    Failed(String),
}

/// Append-only cache of lifted accessors.
#[derive(Default)]
pub struct AccessorCache {
    inner: RwLock<HashMap<AccessorKey, CachedLift>>,
}

impl AccessorCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fetch the cached program for `key`, lifting `func` on first use.
    pub fn get_or_lift(
        &self,
        key: AccessorKey,
        func: &FunctionDescriptor,
        lifter: &AccessorLifter,
    ) -> Result<Arc<AccessorProgram>, LiftError> {
        if let Some(cached) = self.inner.read().expect("accessor cache poisoned").get(&key) {
            return match cached {
                CachedLift::Program(p) => Ok(Arc::clone(p)),
                CachedLift::Failed(reason) => Err(LiftError::PreviouslyFailed {
                    reason: reason.clone(),
                }),
            };
        }

        let lifted = lifter.lift(func);
        let mut map = self.inner.write().expect("accessor cache poisoned");
        match lifted {
            Ok(program) => {
                let program = Arc::new(program);
                // A racing lift of the same function produced the identical
                // program; keep whichever landed first.
                let entry = map
                    .entry(key)
                    .or_insert_with(|| CachedLift::Program(Arc::clone(&program)));
                match entry {
                    CachedLift::Program(p) => Ok(Arc::clone(p)),
                    CachedLift::Failed(reason) => Err(LiftError::PreviouslyFailed {
                        reason: reason.clone(),
                    }),
                }
            }
            Err(err) => {
                debug!("lift of `{}` failed: {err}", func.linkage_name);
                map.entry(key)
                    .or_insert_with(|| CachedLift::Failed(err.to_string()));
                Err(err)
            }
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().expect("accessor cache poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! Validation pipeline
//!
//! A model declares ordered `before_validate` and `after_validate` hooks.
//! On every save the before phase runs in declaration order, then the after
//! phase; the first hook returning `false` stops the chain and the save is
//! rejected without contacting the server.

use std::sync::Arc;

use crate::document::Document;

/// Hook predicate signature
pub type HookFn = dyn Fn(&Document) -> bool + Send + Sync;

/// Validation phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    BeforeValidate,
    AfterValidate,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Phase::BeforeValidate => write!(f, "before_validate"),
            Phase::AfterValidate => write!(f, "after_validate"),
        }
    }
}

/// A named validation predicate
#[derive(Clone)]
pub struct Hook {
    name: String,
    check: Arc<HookFn>,
}

impl std::fmt::Debug for Hook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hook").field("name", &self.name).finish()
    }
}

impl Hook {
    pub fn new<F>(name: impl Into<String>, check: F) -> Self
    where
        F: Fn(&Document) -> bool + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            check: Arc::new(check),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn check(&self, document: &Document) -> bool {
        (self.check)(document)
    }
}

/// Why a save did not happen
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rejection {
    pub phase: Phase,
    pub hook: String,
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} hook '{}' rejected the document", self.phase, self.hook)
    }
}

/// Ordered hooks for both phases
#[derive(Debug, Clone, Default)]
pub struct ValidationPipeline {
    before: Vec<Hook>,
    after: Vec<Hook>,
}

impl ValidationPipeline {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, phase: Phase, hook: Hook) {
        match phase {
            Phase::BeforeValidate => self.before.push(hook),
            Phase::AfterValidate => self.after.push(hook),
        }
    }

    pub fn hooks(&self, phase: Phase) -> &[Hook] {
        match phase {
            Phase::BeforeValidate => &self.before,
            Phase::AfterValidate => &self.after,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.before.is_empty() && self.after.is_empty()
    }

    /// Run both phases, stopping at the first rejecting hook
    pub fn run(&self, document: &Document) -> Result<(), Rejection> {
        for phase in [Phase::BeforeValidate, Phase::AfterValidate] {
            if let Some(hook) = self.hooks(phase).iter().find(|hook| !hook.check(document)) {
                return Err(Rejection {
                    phase,
                    hook: hook.name().to_string(),
                });
            }
        }
        Ok(())
    }
}

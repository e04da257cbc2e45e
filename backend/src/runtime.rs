use std::sync::atomic::{AtomicBool, Ordering};

use log::info;
use model::Model;

use crate::{BackendErr, ComputeContext, ContextConfig, Result};

static INITIALIZED: AtomicBool = AtomicBool::new(false);

/// The process wide backend state.
///
/// At most one `Runtime` is alive at any time, dropping it cleans the backend up and allows a
/// new one to be initialized. Contexts borrow the runtime, so it always outlives them.
#[derive(Debug)]
pub struct Runtime {
    _private: (),
}

impl Runtime {
    /// Initializes the backend for this process.
    ///
    /// # Returns
    /// The runtime, or `AlreadyInitialized` if another one is still alive.
    pub fn initialize() -> Result<Self> {
        INITIALIZED
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| BackendErr::AlreadyInitialized)?;

        info!("backend runtime initialized");
        Ok(Self { _private: () })
    }

    /// Whether a runtime is currently alive in this process.
    pub fn is_initialized() -> bool {
        INITIALIZED.load(Ordering::Acquire)
    }

    /// Creates a compute context that evaluates `model`.
    ///
    /// # Arguments
    /// * `cfg` - The configuration of the context.
    /// * `model` - The model to evaluate, borrowed for the lifetime of the context.
    ///
    /// # Returns
    /// The context, with every device started and tuned for the configured board size.
    pub fn create_context<'a>(
        &'a self,
        cfg: &ContextConfig,
        model: &'a Model,
    ) -> Result<ComputeContext<'a>> {
        ComputeContext::new(self, cfg, model)
    }
}

impl Drop for Runtime {
    fn drop(&mut self) {
        INITIALIZED.store(false, Ordering::Release);
        info!("backend runtime cleaned up");
    }
}

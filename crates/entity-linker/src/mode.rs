//! Computation mode threaded through every encode call.

/// Whether a call runs as a training step or as inference.
///
/// `Train` enables dropout and the additive margin; `Eval` disables both.
/// Inference entry points ([`crate::EntityLinker::predict`] and entity-only
/// forward) additionally detach their outputs from the autograd graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Mode {
    Train,
    #[default]
    Eval,
}

impl Mode {
    pub fn is_training(self) -> bool {
        matches!(self, Mode::Train)
    }
}

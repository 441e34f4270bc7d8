/// Exception machinery: completion records and unwinding
///
/// A `try`/`catch`/`finally` compiles to overlapping protected ranges (see
/// `bytecode::ProtectedRange`'s doc comment); the VM resolves which handler
/// fires via `CompiledCode::handler_for`. What this module adds is the
/// *completion record* a `Finally` handler needs: `return`/`throw` inside a
/// protected range doesn't immediately unwind past a `finally` — it stashes
/// what *would* have happened, runs the finally body, and `Op::FinallyExit`
/// replays the stashed completion (or lets a `finally`-internal
/// `return`/`throw` override it, per ECMAScript's completion-record
/// semantics).
use crate::value::Value;

/// What should happen once the active `finally` body finishes running.
#[derive(Clone, Copy, Debug)]
pub enum Completion {
    /// The protected range ended normally (no throw, no return) — resume
    /// execution right after the `finally` block.
    Normal,
    Return(Value),
    Throw(Value),
}

/// Per-frame stack of pending completions, one pushed per `finally` the
/// frame is currently inside (innermost last). A frame needs a stack, not
/// a single slot, because a `finally` block can itself contain another
/// `try`/`finally`.
#[derive(Default)]
pub struct PendingCompletions(Vec<Completion>);

impl PendingCompletions {
    pub fn push(&mut self, c: Completion) {
        self.0.push(c);
    }

    pub fn pop(&mut self) -> Option<Completion> {
        self.0.pop()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn completions_unwind_innermost_first() {
        let mut stack = PendingCompletions::default();
        stack.push(Completion::Normal);
        stack.push(Completion::Return(Value::from_small_int(7)));
        match stack.pop() {
            Some(Completion::Return(v)) => assert_eq!(v.as_small_int(), Some(7)),
            _ => panic!("expected innermost Return completion first"),
        }
        assert!(matches!(stack.pop(), Some(Completion::Normal)));
        assert!(stack.pop().is_none());
    }
}

//! The [`Command`] trait: a user-defined intent that, once executed, yields
//! a finite event stream and a result.
//!
//! This mirrors the traits module the teacher keeps alongside its primitive
//! types (`toka-types::traits`) — behavioural contracts sit next to the data
//! they operate on rather than in a separate crate.

/// A user-defined intent. `Self::Event` is the payload type yielded while
/// executing; `Self::Output` is the value the command ultimately resolves
/// to, computed from the accumulator `execute` built up along the way.
///
/// Commands are consumed by value on execution (`self: Box<Self>`) since a
/// published command is immutable and owned by the consumer for the
/// duration of its single execution — it is never executed twice.
pub trait Command: Send + 'static {
    /// The type of event this command's execution emits.
    type Event: Send + 'static;
    /// The value `publish` ultimately resolves to.
    type Output: Send + 'static;

    /// Names of the locks this command must hold for the duration of its
    /// execution. The consumer acquires these in sorted order (§4.5) before
    /// invoking `execute`.
    fn lock_names(&self) -> Vec<String> {
        Vec::new()
    }

    /// A short, stable name used as the `kind` of the command's own layout
    /// and in tracing spans. Defaults to the Rust type name, which is stable
    /// enough for tests but not for cross-version wire compatibility —
    /// commands with long-term durability requirements should override it.
    fn kind(&self) -> &'static str {
        std::any::type_name::<Self>()
    }

    /// Execute the command, producing a lazy event stream plus a closure
    /// that folds the (possibly command-internal) accumulator into the
    /// command's result once the stream is drained.
    ///
    /// The returned iterator must be finite in practice; the consumer drains
    /// it fully before proceeding to the Appending phase, so an iterator
    /// that never terminates stalls the command indefinitely. This is the
    /// "lazy, possibly infinite-prefix but in practice finite sequence"
    /// language from the data model section — the laziness lets a command
    /// interleave computing the next event with the consumer already having
    /// stamped and serialized the previous ones.
    fn execute(self: Box<Self>) -> CommandExecution<Self::Event, Self::Output>;
}

/// The result of invoking [`Command::execute`]: a pull-based iterator of
/// events plus a deferred completion closure.
///
/// Modeled as a plain iterator rather than a coroutine/generator — per the
/// design notes, "lazy event streams → pull-based iterators" is the Rust
/// equivalent of the source's suspend-on-yield execution model; the
/// consumer is the one driving the iterator forward.
pub struct CommandExecution<E, O> {
    /// Finite iterator of events yielded by this command's execution.
    pub events: Box<dyn Iterator<Item = E> + Send>,
    /// Deferred completion: maps whatever internal accumulator `execute`
    /// built up into the command's final result. Invoked only after
    /// `events` has been fully drained and appended.
    pub finish: Box<dyn FnOnce() -> O + Send>,
}

impl<E, O> CommandExecution<E, O> {
    /// Build an execution from an iterator and a completion closure.
    pub fn new(
        events: impl Iterator<Item = E> + Send + 'static,
        finish: impl FnOnce() -> O + Send + 'static,
    ) -> Self {
        Self {
            events: Box::new(events),
            finish: Box::new(finish),
        }
    }

    /// Convenience constructor for commands that emit no events and resolve
    /// immediately to a known value.
    pub fn immediate(output: O) -> Self
    where
        O: 'static,
    {
        Self::new(std::iter::empty(), move || output)
    }
}

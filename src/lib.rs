//! Streaming pattern matching driven by continuation-compiled patterns.
//!
//! An [`Engine`] executes an already-compiled pattern (the [`Pattern`]
//! contract) against a stream of tokens delivered one at a time.  Every
//! still-viable interpretation of the pattern is kept alive as a thread
//! in a priority-ordered alternative list; all of them advance in
//! lock-step with the input, so consumed input is never re-scanned and
//! capture results are reported as soon as they are decided.
//! Alternation preference ("leftmost alternative wins") and repeated
//! ("global") matching are resolved by splicing and replacing list
//! entries in place, never by recursive backtracking.
//!
//! # Architecture
//!
//! The caller drives a fixed two-phase cycle per stream symbol:
//!
//! ```text
//! feed(symbol)        shift the prior/pending boundary window
//! epsilon_phase()     resolve every zero-width step, fail threads
//!                     stranded at end-of-stream, then harvest
//!                     completed captures ──► Vec<MatchEvent>
//! consume_phase()     deliver the pending token to every parked
//!                     width-one thread, exactly once
//! ```
//!
//! Zero-width steps (assertions, alternation fan-out) see only the
//! boundary [`Window`] between the previous and the upcoming symbol;
//! width-one steps see exactly one real token.  The stream sentinels
//! ([`Symbol::Start`], [`Symbol::End`]) are visible only through the
//! window: a width-one step is never invoked on a sentinel, and a
//! thread that still needs a token once the window shows end-of-stream
//! can never be satisfied and is failed on the spot.
//!
//! ## Alternative lists, attempts, and the chain
//!
//! ```text
//! attempt #0                          attempt #1
//! head ─ Thread ─ Thread ─ Holder ──► head ─ Thread ─ ...
//!        (prio 1) (prio 2)
//! ```
//!
//! Each matching attempt owns one alternative list.  An entry is either
//! a live thread (a continuation plus private per-thread state) or a
//! holder marking a completed match, behind which the successor attempt
//! continues scanning.  A success stores its captures on the owning
//! attempt and discards every lower-priority entry after it; a later
//! success by a higher-priority thread of the same attempt overwrites
//! the stored captures and discards the superseded holder (and the
//! whole speculative chain behind it) outright.  Stored captures are
//! therefore provisional until no live thread remains in the attempt,
//! and the harvest step at the end of each epsilon phase collects only
//! from attempts whose lists hold no live thread.  This is what keeps
//! "first alternative wins" true even when a lower-priority alternative
//! finishes first.
//!
//! Under global matching every success chains a fresh attempt (identity
//! index one higher) behind the holder; the fresh attempt scans the
//! remainder of the stream in lock-step with its still-undecided
//! predecessors.  Without global matching the holder chains to a dead
//! attempt, so the engine reports one result and stops.
//!
//! ## Memory
//!
//! List entries live in a slab with stable indices and intrusive next
//! links: splicing is index relinking, and freed slots recycle through
//! an intrusive free list threaded through the same links.  Attempts
//! live in a second slab.  Branching clones the parent thread's state
//! once per extra child, so sibling threads never share mutable state.
//! Dropping the engine drops everything it owns with no teardown
//! protocol.

#![warn(missing_docs)]

use std::fmt;
use std::ops::{Index, IndexMut};
use std::rc::Rc;

use log::{debug, trace};

// ---------------------------------------------------------------------------
// Stream symbols and the boundary window
// ---------------------------------------------------------------------------

/// One unit of engine input: a real token or one of the two stream
/// sentinels.
///
/// The sentinels bracket the stream: [`Start`](Symbol::Start) is fed
/// exactly once before the first real token and [`End`](Symbol::End)
/// exactly once after the last.  Because they are enum variants rather
/// than reserved token values, they can never collide with the caller's
/// alphabet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Symbol<T> {
    /// Start-of-stream sentinel.
    Start,
    /// A real token from the caller-defined alphabet.
    Token(T),
    /// End-of-stream sentinel.
    End,
}

impl<T> Symbol<T> {
    /// The real token inside, or `None` for a sentinel.
    pub fn token(&self) -> Option<&T> {
        match self {
            Symbol::Token(token) => Some(token),
            _ => None,
        }
    }

    /// Is this the start-of-stream sentinel?
    pub fn is_start(&self) -> bool {
        matches!(self, Symbol::Start)
    }

    /// Is this the end-of-stream sentinel?
    pub fn is_end(&self) -> bool {
        matches!(self, Symbol::End)
    }

    /// Symbol kind for log lines; avoids a `Debug` bound on `T`.
    fn kind(&self) -> &'static str {
        match self {
            Symbol::Start => "start",
            Symbol::Token(_) => "token",
            Symbol::End => "end",
        }
    }
}

/// The zero-width boundary between two stream positions, handed to
/// [`Continuation::Peek`] steps.
///
/// `prior` is the last symbol shifted past the boundary, `pending` the
/// symbol about to be consumed.  Assertions read both: a start-of-input
/// assertion checks [`at_start`](Self::at_start), a lookahead inspects
/// [`pending`](Self::pending), a lookbehind inspects
/// [`prior`](Self::prior).
pub struct Window<'a, T> {
    prior: &'a Symbol<T>,
    pending: &'a Symbol<T>,
}

impl<'a, T> Window<'a, T> {
    /// Build a window over two symbols.  Useful for unit-testing peek
    /// steps outside an engine.
    #[must_use]
    pub fn new(prior: &'a Symbol<T>, pending: &'a Symbol<T>) -> Self {
        Self { prior, pending }
    }

    /// The symbol most recently shifted past this boundary
    /// ([`Symbol::Start`] before any real token arrived).
    pub fn prior(&self) -> &'a Symbol<T> {
        self.prior
    }

    /// The symbol about to be consumed ([`Symbol::End`] once the stream
    /// is exhausted).
    pub fn pending(&self) -> &'a Symbol<T> {
        self.pending
    }

    /// True at the boundary before the first real token.
    pub fn at_start(&self) -> bool {
        self.prior.is_start()
    }

    /// True at the boundary after the last real token.
    pub fn at_end(&self) -> bool {
        self.pending.is_end()
    }
}

/// Windows copy freely for any token type: they hold two shared
/// references.  A derive would add spurious `T: Clone`/`T: Copy`
/// bounds.
impl<T> Clone for Window<'_, T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Window<'_, T> {}

impl<T: fmt::Debug> fmt::Debug for Window<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Window")
            .field("prior", self.prior)
            .field("pending", self.pending)
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Pattern contract
// ---------------------------------------------------------------------------

/// An externally-compiled pattern: the engine drives it, never owns its
/// meaning.
///
/// A pattern supplies the seed for new matching attempts: a fresh
/// per-thread state value and the first continuation to run.  The state
/// is private to one thread; whenever a thread branches, every child
/// receives its own clone, so `State` must implement a genuine deep
/// [`Clone`]: sibling threads sharing mutable state through the clone
/// is a correctness bug in the pattern, not an optimization.
pub trait Pattern {
    /// The caller-defined token alphabet.
    type Token;
    /// Private per-thread state, cloned on every branch.
    type State: Clone;
    /// Opaque payload produced by [`Transition::Succeed`]; the engine
    /// transports and batches it without interpreting it.
    type Captures;

    /// A fresh state value for a new thread at the start of an attempt.
    fn initial_state(&self) -> Self::State;

    /// The first continuation a new attempt runs.
    fn initial_continuation(&self) -> Continuation<Self>
    where
        Self: Sized;
}

/// Input width a continuation requires before it can resolve.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Width {
    /// Resolves between tokens, consuming nothing.
    Zero,
    /// Resolves by consuming exactly one real token.
    One,
}

/// Step function of a zero-width continuation.
pub type PeekFn<P> = Rc<
    dyn Fn(
        &mut <P as Pattern>::State,
        Window<'_, <P as Pattern>::Token>,
    ) -> Transition<P>,
>;

/// Step function of a one-width continuation.
pub type ConsumeFn<P> =
    Rc<dyn Fn(&mut <P as Pattern>::State, &<P as Pattern>::Token) -> Transition<P>>;

/// The next pending step of a thread.
///
/// The variant is the continuation's required width, so a step function
/// can only ever be handed the context shape it declared: `Peek` steps
/// see the boundary [`Window`], `Consume` steps see one real token.  A
/// width/context mismatch is unrepresentable and never the pattern's
/// job to check.
///
/// Step functions must be deterministic in their inputs: they may
/// mutate the thread's own state (that is what it is for) but nothing
/// else, and must return exactly one [`Transition`] per call.
pub enum Continuation<P: Pattern> {
    /// A zero-width step such as an assertion or an alternation
    /// fan-out.
    Peek(PeekFn<P>),
    /// A one-width step: consumes the pending token.
    Consume(ConsumeFn<P>),
}

impl<P: Pattern> Continuation<P> {
    /// Wrap a closure as a zero-width continuation.
    pub fn peek<F>(step: F) -> Self
    where
        F: Fn(&mut P::State, Window<'_, P::Token>) -> Transition<P> + 'static,
    {
        Self::Peek(Rc::new(step))
    }

    /// Wrap a closure as a one-width continuation.
    pub fn consume<F>(step: F) -> Self
    where
        F: Fn(&mut P::State, &P::Token) -> Transition<P> + 'static,
    {
        Self::Consume(Rc::new(step))
    }

    /// The input width this continuation requires.
    pub fn width(&self) -> Width {
        match self {
            Self::Peek(_) => Width::Zero,
            Self::Consume(_) => Width::One,
        }
    }
}

/// Clones share the underlying step function; only the reference count
/// moves.  A derive would add a spurious `P: Clone` bound.
impl<P: Pattern> Clone for Continuation<P> {
    fn clone(&self) -> Self {
        match self {
            Self::Peek(step) => Self::Peek(Rc::clone(step)),
            Self::Consume(step) => Self::Consume(Rc::clone(step)),
        }
    }
}

impl<P: Pattern> fmt::Debug for Continuation<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Peek(_) => f.write_str("Continuation::Peek"),
            Self::Consume(_) => f.write_str("Continuation::Consume"),
        }
    }
}

/// Outcome of one continuation step.
pub enum Transition<P: Pattern> {
    /// This interpretation is not viable; the thread dies.
    Fail,
    /// The pattern matched along this thread; hand the captures over.
    Succeed(P::Captures),
    /// Split into prioritized successor threads, earlier preferred.
    /// Every child receives an independent clone of this thread's
    /// state.  An empty list is equivalent to [`Fail`](Self::Fail).
    Branch(Vec<Continuation<P>>),
    /// Move this thread to the given continuation in place, without
    /// branching or changing the list shape.  Legal only from `Peek`
    /// steps: a consumed token must resolve definitively.
    Advance(Continuation<P>),
}

impl<P: Pattern> fmt::Debug for Transition<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fail => f.write_str("Fail"),
            Self::Succeed(_) => f.write_str("Succeed(..)"),
            Self::Branch(list) => write!(f, "Branch(len={})", list.len()),
            Self::Advance(cont) => write!(f, "Advance({:?})", cont.width()),
        }
    }
}

// ---------------------------------------------------------------------------
// Events, options, protocol errors
// ---------------------------------------------------------------------------

/// One harvested match: the attempt that produced it plus the captures
/// its winning thread returned.
///
/// Attempt `0` is the attempt live at construction; under global
/// matching each completed match chains a successor numbered one
/// higher, so the attempt number orders repeated matches.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatchEvent<C> {
    /// Identity index of the attempt that completed.
    pub attempt: u64,
    /// The pattern-defined capture payload.
    pub captures: C,
}

/// Engine construction options.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Options {
    /// Keep scanning after a match completes: every success chains a
    /// fresh attempt that searches the rest of the stream.  Off, the
    /// first completed match ends the run.
    ///
    /// A pattern that can succeed without consuming any token will
    /// respawn at the same boundary forever under global matching;
    /// guarding against that is the pattern author's responsibility.
    pub global: bool,
}

/// Fatal protocol misuse by the caller or the pattern.
///
/// These signal a violated invariant, not bad input; an engine that
/// returned one is in an unspecified state and must be discarded
/// (dropping it is free).  Absence of matches is *not* an error; it is
/// an empty event batch.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// The epsilon phase ran without a feed since the previous consume
    /// phase.
    #[error("epsilon phase invoked without a feed since the previous consume phase")]
    EpsilonWithoutFeed,
    /// The consume phase reached a zero-width continuation; the epsilon
    /// phase must drain those first.
    #[error("consume phase reached a zero-width continuation in attempt {attempt}")]
    ZeroWidthConsume {
        /// Identity index of the attempt holding the offending thread.
        attempt: u64,
    },
    /// A width-one step returned [`Transition::Advance`]; consuming a
    /// token must resolve the thread definitively.
    #[error("width-one step returned Advance during the consume phase in attempt {attempt}")]
    AdvanceDuringConsume {
        /// Identity index of the attempt holding the offending thread.
        attempt: u64,
    },
}

// ---------------------------------------------------------------------------
// Entry slab (alternative lists)
// ---------------------------------------------------------------------------

/// Index into the entry slab ([`Entries`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct EntryIdx(u32);

impl EntryIdx {
    /// Sentinel for "no entry": list end and free-list end.
    const NONE: Self = Self(u32::MAX);

    /// Raw index as `usize`.  Panics on `NONE` in debug builds.
    #[inline]
    fn idx(self) -> usize {
        debug_assert!(self != Self::NONE, "EntryIdx::NONE used as index");
        self.0 as usize
    }
}

/// One live candidate interpretation: the next step to run plus the
/// thread's private state.
struct Thread<P: Pattern> {
    cont: Continuation<P>,
    state: P::State,
}

/// One slot of an alternative list.
enum Entry<P: Pattern> {
    /// A live thread, still searching.
    Thread(Thread<P>),
    /// A completed match at this priority slot; the chain continues in
    /// the successor attempt.  At most one holder exists per list and
    /// it is always the last entry: a success discards everything
    /// after itself.
    Holder(AttemptIdx),
}

/// Slab of alternative-list entries with stable indices.
///
/// `links[i]` threads both structures: for an occupied slot it is the
/// next entry in the same list; for a freed slot it is the next free
/// slot.  Every list begins at a payload-free head slot so splicing at
/// the front needs no special case.
struct Entries<P: Pattern> {
    /// Slot payload; `None` for head slots and freed slots.
    slots: Vec<Option<Entry<P>>>,
    /// `links[i]` = successor entry in the same list, or [`EntryIdx::NONE`].
    links: Vec<EntryIdx>,
    /// Head of the intrusive free list threaded through `links`.
    free_head: EntryIdx,
}

impl<P: Pattern> Default for Entries<P> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            links: Vec::new(),
            free_head: EntryIdx::NONE,
        }
    }
}

impl<P: Pattern> Entries<P> {
    fn alloc_slot(&mut self, payload: Option<Entry<P>>) -> EntryIdx {
        if self.free_head != EntryIdx::NONE {
            let idx = self.free_head;
            self.free_head = self.links[idx.idx()];
            self.slots[idx.idx()] = payload;
            self.links[idx.idx()] = EntryIdx::NONE;
            idx
        } else {
            let idx = EntryIdx(self.slots.len() as u32);
            self.slots.push(payload);
            self.links.push(EntryIdx::NONE);
            idx
        }
    }

    /// Allocate an occupied slot, unlinked.
    fn alloc(&mut self, entry: Entry<P>) -> EntryIdx {
        self.alloc_slot(Some(entry))
    }

    /// Allocate a payload-free list head.
    fn alloc_head(&mut self) -> EntryIdx {
        self.alloc_slot(None)
    }

    /// Return a slot to the free list, yielding its payload (if any).
    fn free(&mut self, idx: EntryIdx) -> Option<Entry<P>> {
        let entry = self.slots[idx.idx()].take();
        self.links[idx.idx()] = self.free_head;
        self.free_head = idx;
        entry
    }

    /// Successor of `idx` in its list.
    #[inline]
    fn next(&self, idx: EntryIdx) -> EntryIdx {
        self.links[idx.idx()]
    }

    #[inline]
    fn set_next(&mut self, idx: EntryIdx, to: EntryIdx) {
        self.links[idx.idx()] = to;
    }

    /// Insert `idx` directly after `prev` in `prev`'s list.
    fn link_after(&mut self, prev: EntryIdx, idx: EntryIdx) {
        self.links[idx.idx()] = self.links[prev.idx()];
        self.links[prev.idx()] = idx;
    }

    /// Move the payload out of a slot, leaving it vacant but linked.
    /// The caller either restores a payload with [`put`](Self::put) or
    /// frees the slot before the walk moves on.
    fn take(&mut self, idx: EntryIdx) -> Entry<P> {
        self.slots[idx.idx()].take().unwrap()
    }

    /// Restore a payload taken with [`take`](Self::take) (or fill a
    /// fresh head-style slot).
    fn put(&mut self, idx: EntryIdx, entry: Entry<P>) {
        debug_assert!(self.slots[idx.idx()].is_none(), "entry slot already occupied");
        self.slots[idx.idx()] = Some(entry);
    }
}

/// `entries[idx]`: read access to an occupied slot.
impl<P: Pattern> Index<EntryIdx> for Entries<P> {
    type Output = Entry<P>;

    #[inline]
    fn index(&self, idx: EntryIdx) -> &Entry<P> {
        self.slots[idx.idx()].as_ref().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Attempt slab (match contexts)
// ---------------------------------------------------------------------------

/// Index into the attempt slab ([`Attempts`]).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct AttemptIdx(u32);

impl AttemptIdx {
    #[inline]
    fn idx(self) -> usize {
        self.0 as usize
    }
}

/// One matching attempt: an alternative list plus the captures of its
/// accepted thread, if any.
///
/// Captures are provisional while the list still holds live threads (a
/// higher-priority thread can overwrite them) and are collected by the
/// harvest walk only once no live thread remains.
struct Attempt<P: Pattern> {
    /// Identity index: 0 for the attempt live at construction, parent
    /// plus one for every chained successor.
    index: u64,
    /// Payload-free head slot of this attempt's alternative list.
    head: EntryIdx,
    /// Captures from this attempt's accepted thread.
    captures: Option<P::Captures>,
}

/// Slab of attempts; freed slots recycle through a plain stack.
struct Attempts<P: Pattern> {
    slots: Vec<Option<Attempt<P>>>,
    free: Vec<AttemptIdx>,
}

impl<P: Pattern> Default for Attempts<P> {
    fn default() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
        }
    }
}

impl<P: Pattern> Attempts<P> {
    fn alloc(&mut self, attempt: Attempt<P>) -> AttemptIdx {
        if let Some(idx) = self.free.pop() {
            self.slots[idx.idx()] = Some(attempt);
            idx
        } else {
            let idx = AttemptIdx(self.slots.len() as u32);
            self.slots.push(Some(attempt));
            idx
        }
    }

    fn free(&mut self, idx: AttemptIdx) -> Attempt<P> {
        let attempt = self.slots[idx.idx()].take().unwrap();
        self.free.push(idx);
        attempt
    }
}

/// `attempts[idx]`: read access to a live attempt.
impl<P: Pattern> Index<AttemptIdx> for Attempts<P> {
    type Output = Attempt<P>;

    #[inline]
    fn index(&self, idx: AttemptIdx) -> &Attempt<P> {
        self.slots[idx.idx()].as_ref().unwrap()
    }
}

impl<P: Pattern> IndexMut<AttemptIdx> for Attempts<P> {
    #[inline]
    fn index_mut(&mut self, idx: AttemptIdx) -> &mut Attempt<P> {
        self.slots[idx.idx()].as_mut().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The streaming matcher: owns the attempt chain and drives the
/// two-phase cycle.
///
/// Construct once per stream, then drive one cycle per symbol (start
/// sentinel, each token, end sentinel): [`feed`](Self::feed), collect
/// [`epsilon_phase`](Self::epsilon_phase) events, and unless
/// [`done`](Self::done), run [`consume_phase`](Self::consume_phase).
/// Stop feeding once `done`; extra feeds are harmless no-ops.
///
/// The engine is a synchronous single-writer state machine: it never
/// blocks or spawns, and may be dropped at any point with no teardown.
pub struct Engine<P: Pattern> {
    pattern: P,
    global: bool,
    entries: Entries<P>,
    attempts: Attempts<P>,
    /// First attempt whose result is still undecided; earlier attempts
    /// have been harvested and detached.
    root: AttemptIdx,
    /// Boundary window: the symbol most recently shifted past it.
    prior: Symbol<P::Token>,
    /// The symbol fed most recently, about to be consumed.
    pending: Symbol<P::Token>,
    /// Set by the consume phase, cleared by [`feed`](Self::feed); an
    /// epsilon phase while starved is a protocol error.
    starved: bool,
    /// Caller-maintained stream offset.  The engine initializes it to
    /// zero and never reads or writes it afterwards; maintain it (or
    /// ignore it) as suits the surrounding code.
    pub position: u64,
}

impl<P: Pattern> Engine<P> {
    /// Build an engine over `pattern`, seeding attempt 0 with the
    /// pattern's initial thread.
    pub fn new(pattern: P, options: Options) -> Self {
        let mut entries = Entries::default();
        let mut attempts = Attempts::default();

        let head = entries.alloc_head();
        let seed = entries.alloc(Entry::Thread(Thread {
            cont: pattern.initial_continuation(),
            state: pattern.initial_state(),
        }));
        entries.link_after(head, seed);
        let root = attempts.alloc(Attempt {
            index: 0,
            head,
            captures: None,
        });

        debug!("engine ready (global: {})", options.global);
        Self {
            pattern,
            global: options.global,
            entries,
            attempts,
            root,
            prior: Symbol::Start,
            pending: Symbol::Start,
            starved: false,
            position: 0,
        }
    }

    /// No live thread and no pending chained attempt remain: nothing
    /// this engine does from here on can produce another match.
    #[must_use]
    pub fn done(&self) -> bool {
        self.entries.next(self.attempts[self.root].head) == EntryIdx::NONE
    }

    /// Count of live threads across the whole attempt chain.  Zero once
    /// [`done`](Self::done); useful for diagnostics and log lines.
    #[must_use]
    pub fn live_threads(&self) -> usize {
        self.count_threads(self.root)
    }

    fn count_threads(&self, at: AttemptIdx) -> usize {
        let mut n = 0;
        let mut cur = self.entries.next(self.attempts[at].head);
        while cur != EntryIdx::NONE {
            match &self.entries[cur] {
                Entry::Thread(_) => n += 1,
                Entry::Holder(child) => n += self.count_threads(*child),
            }
            cur = self.entries.next(cur);
        }
        n
    }

    /// Shift the boundary window: `prior` takes the old pending symbol,
    /// `pending` takes `symbol`.  Clears the starved flag unless the
    /// symbol is [`Symbol::Start`].  A no-op once [`done`](Self::done).
    pub fn feed(&mut self, symbol: Symbol<P::Token>) {
        if self.done() {
            trace!("feed ignored: engine is done");
            return;
        }
        if !symbol.is_start() {
            self.starved = false;
        }
        trace!("feed: {}", symbol.kind());
        self.prior = std::mem::replace(&mut self.pending, symbol);
    }

    /// Drain every zero-width step in priority order, fail threads
    /// stranded at end-of-stream, then harvest completed captures from
    /// the front of the attempt chain.
    ///
    /// Returns the harvested batch in completion order; an empty batch
    /// means "no news", not failure.  Calling this twice after one feed
    /// is legal and the second batch is empty; calling it with no feed
    /// since the previous consume phase is a protocol error.
    pub fn epsilon_phase(&mut self) -> Result<Vec<MatchEvent<P::Captures>>, ProtocolError> {
        if self.done() {
            return Ok(Vec::new());
        }
        if self.starved {
            return Err(ProtocolError::EpsilonWithoutFeed);
        }

        let root = self.root;
        let mut batch = Vec::new();
        let mut pass = self.pass();
        pass.drain(root);
        let new_root = pass.harvest(root, &mut batch);
        self.root = new_root;

        trace!(
            "epsilon phase: {} event(s), {} live thread(s)",
            batch.len(),
            self.live_threads()
        );
        Ok(batch)
    }

    /// Deliver the pending token to every parked width-one thread,
    /// exactly once each, in priority order.
    ///
    /// When the pending symbol is a sentinel there is nothing to
    /// deliver and the pass is skipped.  Either way the engine is
    /// marked ready for the next feed.
    pub fn consume_phase(&mut self) -> Result<(), ProtocolError> {
        if self.done() {
            return Ok(());
        }
        self.starved = true;

        let root = self.root;
        let mut pass = self.pass();
        let pending = pass.pending;
        if let Symbol::Token(token) = pending {
            pass.deliver(root, token)?;
            trace!("consume phase: token delivered");
        } else {
            trace!("consume phase: sentinel pending, nothing to deliver");
        }
        Ok(())
    }

    fn pass(&mut self) -> Pass<'_, P> {
        Pass {
            pattern: &self.pattern,
            entries: &mut self.entries,
            attempts: &mut self.attempts,
            prior: &self.prior,
            pending: &self.pending,
            global: self.global,
        }
    }
}

impl<P: Pattern> fmt::Debug for Engine<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Engine")
            .field("global", &self.global)
            .field("attempt", &self.attempts[self.root].index)
            .field("live_threads", &self.live_threads())
            .field("done", &self.done())
            .field("starved", &self.starved)
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// Phase driver
// ---------------------------------------------------------------------------

/// How an attempt's list looks to the harvest walk.
enum Front {
    /// At least one live thread; the attempt's result is undecided.
    Live,
    /// No entries at all: a permanently dead attempt.
    Empty,
    /// No live threads; the sole holder chains to this successor.
    Chain(AttemptIdx),
}

/// Short-lived worker borrowing the engine's internals for one phase.
///
/// All traversal is explicit `(prev, cur)` index cursors over the entry
/// slab; there is no hidden engine-level cursor to invalidate.  The
/// walks recurse into the attempt behind *every* holder they pass:
/// successor attempts spawned behind a still-live higher-priority
/// thread are speculative, but they must scan the stream in lock-step
/// or they would miss the tokens fed while their predecessor was
/// undecided.
struct Pass<'a, P: Pattern> {
    pattern: &'a P,
    entries: &'a mut Entries<P>,
    attempts: &'a mut Attempts<P>,
    prior: &'a Symbol<P::Token>,
    pending: &'a Symbol<P::Token>,
    global: bool,
}

impl<'a, P: Pattern> Pass<'a, P> {
    // -- epsilon phase ------------------------------------------------------

    /// Run every zero-width step in `at`'s list (and every reachable
    /// nested attempt) until only parked width-one threads and holders
    /// remain.  Width-one threads encountered while the pending symbol
    /// is end-of-stream can never be satisfied and are failed here.
    fn drain(&mut self, at: AttemptIdx) {
        let window = Window {
            prior: self.prior,
            pending: self.pending,
        };
        let at_end = window.at_end();

        let mut prev = self.attempts[at].head;
        loop {
            let cur = self.entries.next(prev);
            if cur == EntryIdx::NONE {
                break;
            }

            let thread = match self.entries.take(cur) {
                Entry::Holder(child) => {
                    // Chain link: restore it and drain the nested
                    // attempt in place.
                    self.entries.put(cur, Entry::Holder(child));
                    self.drain(child);
                    prev = cur;
                    continue;
                }
                Entry::Thread(thread) => thread,
            };
            let Thread { cont, mut state } = thread;

            match cont {
                Continuation::Consume(step) => {
                    if at_end {
                        // Stranded: no real token can arrive anymore.
                        trace!("force-failed a thread still waiting for a token at end of stream");
                        self.entries.set_next(prev, self.entries.next(cur));
                        self.entries.free(cur);
                    } else {
                        // Parked until the consume phase.
                        self.entries.put(
                            cur,
                            Entry::Thread(Thread {
                                cont: Continuation::Consume(step),
                                state,
                            }),
                        );
                        prev = cur;
                    }
                }
                Continuation::Peek(step) => {
                    match step(&mut state, window) {
                        Transition::Fail => {
                            self.entries.set_next(prev, self.entries.next(cur));
                            self.entries.free(cur);
                            // The cursor stays on `prev`: the entry
                            // that slid into this position runs next.
                        }
                        Transition::Advance(cont) => {
                            // Same thread, new step; re-examined on the
                            // next loop turn.
                            self.entries.put(cur, Entry::Thread(Thread { cont, state }));
                        }
                        Transition::Branch(children) if children.is_empty() => {
                            self.entries.set_next(prev, self.entries.next(cur));
                            self.entries.free(cur);
                        }
                        Transition::Branch(children) => {
                            self.expand(cur, children, state);
                            // Processing resumes at the first child,
                            // which now occupies `cur`.
                        }
                        Transition::Succeed(captures) => {
                            self.complete(at, cur, captures);
                            // The loop re-reads `cur`, finds the fresh
                            // holder, and drains the successor attempt
                            // within this same phase.
                        }
                    }
                }
            }
        }
    }

    // -- consume phase ------------------------------------------------------

    /// Step every parked width-one thread in `at`'s list (and every
    /// reachable nested attempt) once with `token`.  Entries created by
    /// the pass itself (branch children, freshly spawned successor
    /// attempts) are skipped: the token was already delivered to their
    /// parent, and zero-width children wait for the next epsilon phase.
    fn deliver(&mut self, at: AttemptIdx, token: &P::Token) -> Result<(), ProtocolError> {
        let mut prev = self.attempts[at].head;
        loop {
            let cur = self.entries.next(prev);
            if cur == EntryIdx::NONE {
                break;
            }

            let thread = match self.entries.take(cur) {
                Entry::Holder(child) => {
                    self.entries.put(cur, Entry::Holder(child));
                    self.deliver(child, token)?;
                    prev = cur;
                    continue;
                }
                Entry::Thread(thread) => thread,
            };
            let Thread { cont, mut state } = thread;

            let step = match cont {
                Continuation::Consume(step) => step,
                Continuation::Peek(step) => {
                    let attempt = self.attempts[at].index;
                    self.entries.put(
                        cur,
                        Entry::Thread(Thread {
                            cont: Continuation::Peek(step),
                            state,
                        }),
                    );
                    return Err(ProtocolError::ZeroWidthConsume { attempt });
                }
            };

            match step(&mut state, token) {
                Transition::Fail => {
                    self.entries.set_next(prev, self.entries.next(cur));
                    self.entries.free(cur);
                    // The entry sliding into this position predates the
                    // pass and still gets its delivery.
                }
                Transition::Advance(_) => {
                    let attempt = self.attempts[at].index;
                    self.entries.put(
                        cur,
                        Entry::Thread(Thread {
                            cont: Continuation::Consume(step),
                            state,
                        }),
                    );
                    return Err(ProtocolError::AdvanceDuringConsume { attempt });
                }
                Transition::Branch(children) if children.is_empty() => {
                    self.entries.set_next(prev, self.entries.next(cur));
                    self.entries.free(cur);
                }
                Transition::Branch(children) => {
                    // Skip past every child: the token went to the
                    // parent, exactly once.
                    prev = self.expand(cur, children, state);
                }
                Transition::Succeed(captures) => {
                    self.complete(at, cur, captures);
                    // No descent into the fresh holder: the successor
                    // attempt starts at the next stream position.
                    prev = cur;
                }
            }
        }
        Ok(())
    }

    // -- shared transition plumbing ----------------------------------------

    /// Replace the (vacated) entry at `cur` with the branch children in
    /// order, cloning the parent state for each extra child.  Returns
    /// the slot of the last child.
    fn expand(
        &mut self,
        cur: EntryIdx,
        children: Vec<Continuation<P>>,
        state: P::State,
    ) -> EntryIdx {
        let mut children = children.into_iter();
        let first = children.next().unwrap();
        let mut anchor = cur;
        for cont in children {
            let idx = self.entries.alloc(Entry::Thread(Thread {
                cont,
                state: state.clone(),
            }));
            self.entries.link_after(anchor, idx);
            anchor = idx;
        }
        self.entries.put(cur, Entry::Thread(Thread { cont: first, state }));
        anchor
    }

    /// Commit a success at `cur`: record the captures on the owning
    /// attempt (overwriting any lower-priority provisional result),
    /// discard every lower-priority entry after `cur`, and chain the
    /// successor attempt behind a fresh holder.
    fn complete(&mut self, at: AttemptIdx, cur: EntryIdx, captures: P::Captures) {
        self.discard_tail(cur);
        self.attempts[at].captures = Some(captures);
        let successor = self.spawn_successor(at);
        self.entries.put(cur, Entry::Holder(successor));
    }

    /// Chain a new attempt after a success: searching from scratch
    /// under global matching, permanently dead otherwise.
    fn spawn_successor(&mut self, at: AttemptIdx) -> AttemptIdx {
        let index = self.attempts[at].index + 1;
        let head = self.entries.alloc_head();
        if self.global {
            let seed = self.entries.alloc(Entry::Thread(Thread {
                cont: self.pattern.initial_continuation(),
                state: self.pattern.initial_state(),
            }));
            self.entries.link_after(head, seed);
        }
        trace!("attempt {index} chained behind completed match");
        self.attempts.alloc(Attempt {
            index,
            head,
            captures: None,
        })
    }

    /// Free every entry strictly after `from`, tearing down any chained
    /// attempt reachable through a discarded holder.
    fn discard_tail(&mut self, from: EntryIdx) {
        loop {
            let cur = self.entries.next(from);
            if cur == EntryIdx::NONE {
                break;
            }
            self.entries.set_next(from, self.entries.next(cur));
            if let Some(Entry::Holder(child)) = self.entries.free(cur) {
                self.discard_attempt(child);
            }
        }
    }

    /// Tear down an attempt and everything chained behind it.
    fn discard_attempt(&mut self, at: AttemptIdx) {
        let attempt = self.attempts.free(at);
        self.discard_tail(attempt.head);
        self.entries.free(attempt.head);
    }

    // -- harvest ------------------------------------------------------------

    /// Collect completed captures from the front of the chain.
    ///
    /// Walks from `root` while the front attempt's result is sealed:
    /// detaches the attempt, moves its captures into `batch`, and
    /// follows its holder to the successor.  Stops at the first attempt
    /// that still has live work (its captures, if any, are provisional
    /// and stay put) or at a dead end.  Returns the new root.
    /// Detaching makes double emission impossible: a collected attempt
    /// no longer exists.
    fn harvest(
        &mut self,
        mut root: AttemptIdx,
        batch: &mut Vec<MatchEvent<P::Captures>>,
    ) -> AttemptIdx {
        loop {
            let child = match self.front(root) {
                // Undecided, or permanently dead with no successor:
                // the chain front stays where it is.
                Front::Live | Front::Empty => break,
                Front::Chain(child) => child,
            };
            let dead = self.attempts.free(root);
            let holder = self.entries.next(dead.head);
            self.entries.free(holder);
            self.entries.free(dead.head);
            if let Some(captures) = dead.captures {
                trace!("harvest: attempt {} completed", dead.index);
                batch.push(MatchEvent {
                    attempt: dead.index,
                    captures,
                });
            }
            root = child;
        }
        root
    }

    /// Classify `at`'s list for the harvest walk.
    fn front(&self, at: AttemptIdx) -> Front {
        let mut cur = self.entries.next(self.attempts[at].head);
        let mut front = Front::Empty;
        while cur != EntryIdx::NONE {
            match &self.entries[cur] {
                Entry::Thread(_) => return Front::Live,
                Entry::Holder(child) => front = Front::Chain(*child),
            }
            cur = self.entries.next(cur);
        }
        front
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

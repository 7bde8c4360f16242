//! Fine-grained reactive primitives: signals, lazily computed values and effects.
//!
//! The graph is owned by a [`Reactive`] value and every operation that may run user
//! code (reading a stale computed value, writing a signal, creating an effect) takes
//! the embedding context `C` explicitly. Effect and derive functions receive both the
//! graph and the context, so the VM can be the context without any shared mutable
//! state between them.
//!
//! Scheduling is push-invalidate / pull-recompute:
//! - a write that changes a value marks dependent computed values stale (transitively)
//!   and queues dependent effects;
//! - queued effects run when the outermost write or batch completes, each at most once
//!   per flush round, in creation order;
//! - a computed value recomputes only when it is read while stale.
//!
//! Effects that keep re-scheduling themselves are cut off after
//! [`ReactiveLimits::max_flush_rounds`] rounds with [`ReactiveError::Cycle`].

use std::{fmt, marker::PhantomData, rc::Rc};

use indexmap::IndexSet;

use crate::{
    arena::{Arena, ArenaKey},
    resource::ReactiveLimits,
};

/// Handle to a signal or computed value.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(ArenaKey);

impl fmt::Debug for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SignalId({:?})", self.0)
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "s{}", self.0.index())
    }
}

/// Handle to an effect.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EffectId(ArenaKey);

impl fmt::Debug for EffectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EffectId({:?})", self.0)
    }
}

/// The embedding of the reactive graph: value type and error type flowing through
/// user callbacks.
pub trait Context {
    type Value: Clone + PartialEq + fmt::Debug;
    type Error: From<ReactiveError>;
}

/// Re-runnable effect body.
pub type EffectFn<C> = Rc<dyn Fn(&mut Reactive<C>, &mut C) -> Result<(), <C as Context>::Error>>;

/// Derivation of a computed value.
pub type DeriveFn<C> =
    Rc<dyn Fn(&mut Reactive<C>, &mut C) -> Result<<C as Context>::Value, <C as Context>::Error>>;

/// Which bound a runaway reactive graph hit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleKind {
    /// Effects kept re-scheduling each other for more flush rounds than allowed.
    FlushRounds(usize),
    /// Effect runs nested deeper than allowed.
    EffectDepth(usize),
    /// A computed value read itself while being computed.
    Computed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReactiveError {
    /// The graph did not settle: the runtime form of a reactive cycle.
    Cycle(CycleKind),
    /// Computed values cannot be written.
    ReadOnly(SignalId),
    /// The signal was disposed together with its scope.
    Disposed(SignalId),
}

impl fmt::Display for ReactiveError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle(CycleKind::FlushRounds(limit)) => {
                write!(f, "reactive cycle: effects did not settle within {limit} flush rounds")
            }
            Self::Cycle(CycleKind::EffectDepth(limit)) => {
                write!(f, "reactive cycle: effect nesting exceeded {limit}")
            }
            Self::Cycle(CycleKind::Computed) => write!(f, "reactive cycle: computed value depends on itself"),
            Self::ReadOnly(id) => write!(f, "computed value {id} is read-only"),
            Self::Disposed(id) => write!(f, "signal {id} was disposed"),
        }
    }
}

impl std::error::Error for ReactiveError {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Observer {
    Effect(EffectId),
    Computed(SignalId),
}

type ObserverSet = IndexSet<Observer, ahash::RandomState>;

struct Source<C: Context> {
    /// `None` only for a computed value that has never been read.
    value: Option<C::Value>,
    /// Set for computed values, `None` for plain signals.
    derive: Option<DeriveFn<C>>,
    /// A source changed since `value` was derived.
    stale: bool,
    /// Derivation in progress; reading the value again is a cycle.
    computing: bool,
    /// Effects and computed values that read this source.
    subscribers: ObserverSet,
    /// What a computed value read during its last derivation.
    sources: Vec<SignalId>,
}

struct EffectNode<C: Context> {
    run: EffectFn<C>,
    /// Signals read during the last run; unsubscribed before the next.
    sources: Vec<SignalId>,
    /// Creation order, used to run queued effects deterministically.
    seq: u64,
}

/// A reactive graph of signals, computed values and effects.
pub struct Reactive<C: Context> {
    signals: Arena<Source<C>>,
    effects: Arena<EffectNode<C>>,
    /// Innermost entry is the current observer; `None` marks untracked execution.
    observers: Vec<Option<Observer>>,
    /// Effects waiting for the next flush.
    pending: IndexSet<EffectId, ahash::RandomState>,
    /// Open `batch` calls; effects flush when it drops back to zero.
    batch_depth: u32,
    flushing: bool,
    /// Effect runs currently nested on the stack.
    effect_depth: usize,
    next_seq: u64,
    limits: ReactiveLimits,
}

impl<C: Context> fmt::Debug for Reactive<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reactive")
            .field("signals", &self.signals.len())
            .field("effects", &self.effects.len())
            .field("pending", &self.pending.len())
            .finish_non_exhaustive()
    }
}

impl<C: Context> Default for Reactive<C> {
    fn default() -> Self {
        Self::new(ReactiveLimits::default())
    }
}

impl<C: Context> Reactive<C> {
    #[must_use]
    pub fn new(limits: ReactiveLimits) -> Self {
        Self {
            signals: Arena::new(),
            effects: Arena::new(),
            observers: Vec::new(),
            pending: IndexSet::default(),
            batch_depth: 0,
            flushing: false,
            effect_depth: 0,
            next_seq: 0,
            limits,
        }
    }

    /// Creates a writable signal.
    pub fn signal(&mut self, value: C::Value) -> SignalId {
        SignalId(self.signals.insert(Source {
            value: Some(value),
            derive: None,
            stale: false,
            computing: false,
            subscribers: ObserverSet::default(),
            sources: Vec::new(),
        }))
    }

    /// Creates a computed value. Nothing runs until the first read.
    pub fn computed<F>(&mut self, derive: F) -> SignalId
    where
        F: Fn(&mut Self, &mut C) -> Result<C::Value, C::Error> + 'static,
    {
        let derive: DeriveFn<C> = Rc::new(derive);
        SignalId(self.signals.insert(Source {
            value: None,
            derive: Some(derive),
            stale: true,
            computing: false,
            subscribers: ObserverSet::default(),
            sources: Vec::new(),
        }))
    }

    /// Creates an effect and runs it once to collect its dependencies.
    ///
    /// If the first run fails the effect is disposed again and the error returned.
    pub fn effect<F>(&mut self, cx: &mut C, run: F) -> Result<EffectId, C::Error>
    where
        F: Fn(&mut Self, &mut C) -> Result<(), C::Error> + 'static,
    {
        let run: EffectFn<C> = Rc::new(run);
        let seq = self.next_seq;
        self.next_seq += 1;
        let id = EffectId(self.effects.insert(EffectNode {
            run,
            sources: Vec::new(),
            seq,
        }));
        // writes made by the first run are flushed after it, never re-entrantly
        if let Err(err) = self.batch(cx, |rx, cx| rx.run_effect(cx, id)) {
            self.dispose_effect(id);
            return Err(err);
        }
        Ok(id)
    }

    /// Returns the current value, registering the running observer as a dependent.
    pub fn read(&mut self, cx: &mut C, id: SignalId) -> Result<C::Value, C::Error> {
        let needs_refresh = {
            let source = self.signals.get(id.0).ok_or(ReactiveError::Disposed(id))?;
            source.derive.is_some() && (source.stale || source.value.is_none())
        };
        if needs_refresh {
            self.refresh(cx, id)?;
        }
        self.track(id);
        let source = self.signals.get(id.0).ok_or(ReactiveError::Disposed(id))?;
        source.value.clone().ok_or_else(|| ReactiveError::Disposed(id).into())
    }

    /// Returns the cached value without tracking or recomputing.
    #[must_use]
    pub fn peek(&self, id: SignalId) -> Option<&C::Value> {
        self.signals.get(id.0).and_then(|source| source.value.as_ref())
    }

    /// Writes a signal. Returns whether the value changed.
    ///
    /// Writing a value equal to the current one does nothing. Otherwise dependents are
    /// invalidated and, unless a batch or flush is already in progress, queued effects
    /// run before this returns.
    pub fn write(&mut self, cx: &mut C, id: SignalId, value: C::Value) -> Result<bool, C::Error> {
        let source = self.signals.get_mut(id.0).ok_or(ReactiveError::Disposed(id))?;
        if source.derive.is_some() {
            return Err(ReactiveError::ReadOnly(id).into());
        }
        if source.value.as_ref() == Some(&value) {
            return Ok(false);
        }
        source.value = Some(value);
        let subscribers: Vec<Observer> = source.subscribers.iter().copied().collect();
        self.invalidate(subscribers);
        self.flush(cx)?;
        Ok(true)
    }

    /// Runs `f` with effect scheduling deferred until it returns.
    pub fn batch<R>(
        &mut self,
        cx: &mut C,
        f: impl FnOnce(&mut Self, &mut C) -> Result<R, C::Error>,
    ) -> Result<R, C::Error> {
        self.batch_depth += 1;
        let result = f(self, cx);
        self.batch_depth -= 1;
        let value = result?;
        self.flush(cx)?;
        Ok(value)
    }

    /// Runs `f` without registering dependencies for the current observer.
    pub fn untracked<R>(&mut self, f: impl FnOnce(&mut Self) -> R) -> R {
        self.observers.push(None);
        let result = f(self);
        self.observers.pop();
        result
    }

    /// Runs queued effects until the graph settles.
    pub fn flush(&mut self, cx: &mut C) -> Result<(), C::Error> {
        if self.flushing || self.batch_depth > 0 {
            return Ok(());
        }
        self.flushing = true;
        let result = self.drain(cx);
        self.flushing = false;
        if result.is_err() {
            self.pending.clear();
        }
        result
    }

    pub fn dispose_effect(&mut self, id: EffectId) {
        self.unsubscribe(Observer::Effect(id));
        self.pending.shift_remove(&id);
        self.effects.remove(id.0);
    }

    pub fn dispose_signal(&mut self, id: SignalId) {
        let Some(source) = self.signals.get_mut(id.0) else {
            return;
        };
        let subscribers = std::mem::take(&mut source.subscribers);
        for observer in subscribers {
            match observer {
                Observer::Effect(effect) => {
                    if let Some(node) = self.effects.get_mut(effect.0) {
                        node.sources.retain(|s| *s != id);
                    }
                }
                Observer::Computed(computed) => {
                    if let Some(node) = self.signals.get_mut(computed.0) {
                        node.sources.retain(|s| *s != id);
                    }
                }
            }
        }
        self.unsubscribe(Observer::Computed(id));
        self.signals.remove(id.0);
    }

    #[must_use]
    pub fn is_alive(&self, id: SignalId) -> bool {
        self.signals.contains(id.0)
    }

    #[must_use]
    pub fn is_computed(&self, id: SignalId) -> bool {
        self.signals.get(id.0).is_some_and(|source| source.derive.is_some())
    }

    #[must_use]
    pub fn effect_alive(&self, id: EffectId) -> bool {
        self.effects.contains(id.0)
    }

    /// Number of live signals and computed values.
    #[must_use]
    pub fn signal_count(&self) -> usize {
        self.signals.len()
    }

    #[must_use]
    pub fn effect_count(&self) -> usize {
        self.effects.len()
    }

    /// Number of observers currently subscribed to `id`.
    #[must_use]
    pub fn subscriber_count(&self, id: SignalId) -> usize {
        self.signals.get(id.0).map_or(0, |source| source.subscribers.len())
    }

    fn drain(&mut self, cx: &mut C) -> Result<(), C::Error> {
        let mut rounds = 0;
        while !self.pending.is_empty() {
            rounds += 1;
            if rounds > self.limits.max_flush_rounds {
                return Err(ReactiveError::Cycle(CycleKind::FlushRounds(self.limits.max_flush_rounds)).into());
            }
            let mut round: Vec<EffectId> = self.pending.iter().copied().collect();
            round.sort_by_key(|id| self.effects.get(id.0).map_or(u64::MAX, |node| node.seq));
            for id in round {
                // skipped when disposed by an earlier effect of this round
                if !self.pending.shift_remove(&id) {
                    continue;
                }
                self.run_effect(cx, id)?;
            }
        }
        Ok(())
    }

    fn run_effect(&mut self, cx: &mut C, id: EffectId) -> Result<(), C::Error> {
        let Some(node) = self.effects.get(id.0) else {
            return Ok(());
        };
        let run = Rc::clone(&node.run);
        if self.effect_depth >= self.limits.max_effect_depth {
            return Err(ReactiveError::Cycle(CycleKind::EffectDepth(self.limits.max_effect_depth)).into());
        }
        self.unsubscribe(Observer::Effect(id));
        self.effect_depth += 1;
        self.observers.push(Some(Observer::Effect(id)));
        let result = run(self, cx);
        self.observers.pop();
        self.effect_depth -= 1;
        result
    }

    fn refresh(&mut self, cx: &mut C, id: SignalId) -> Result<(), C::Error> {
        let derive = {
            let source = self.signals.get_mut(id.0).ok_or(ReactiveError::Disposed(id))?;
            if source.computing {
                return Err(ReactiveError::Cycle(CycleKind::Computed).into());
            }
            source.computing = true;
            source.derive.clone()
        };
        let Some(derive) = derive else {
            return Ok(());
        };
        self.unsubscribe(Observer::Computed(id));
        self.observers.push(Some(Observer::Computed(id)));
        let result = derive(self, cx);
        self.observers.pop();
        let source = self.signals.get_mut(id.0).ok_or(ReactiveError::Disposed(id))?;
        source.computing = false;
        source.value = Some(result?);
        source.stale = false;
        Ok(())
    }

    fn track(&mut self, id: SignalId) {
        let Some(Some(observer)) = self.observers.last().copied() else {
            return;
        };
        let Some(source) = self.signals.get_mut(id.0) else {
            return;
        };
        if !source.subscribers.insert(observer) {
            return;
        }
        match observer {
            Observer::Effect(effect) => {
                if let Some(node) = self.effects.get_mut(effect.0) {
                    node.sources.push(id);
                }
            }
            Observer::Computed(computed) => {
                if let Some(node) = self.signals.get_mut(computed.0) {
                    node.sources.push(id);
                }
            }
        }
    }

    /// Drops every subscription `observer` holds.
    fn unsubscribe(&mut self, observer: Observer) {
        let sources = match observer {
            Observer::Effect(effect) => self
                .effects
                .get_mut(effect.0)
                .map(|node| std::mem::take(&mut node.sources)),
            Observer::Computed(computed) => self
                .signals
                .get_mut(computed.0)
                .map(|node| std::mem::take(&mut node.sources)),
        };
        for source in sources.into_iter().flatten() {
            if let Some(node) = self.signals.get_mut(source.0) {
                node.subscribers.shift_remove(&observer);
            }
        }
    }

    fn invalidate(&mut self, mut queue: Vec<Observer>) {
        while let Some(observer) = queue.pop() {
            match observer {
                Observer::Effect(effect) => {
                    if self.effects.contains(effect.0) {
                        self.pending.insert(effect);
                    }
                }
                Observer::Computed(computed) => {
                    if let Some(node) = self.signals.get_mut(computed.0)
                        && !node.stale
                    {
                        node.stale = true;
                        queue.extend(node.subscribers.iter().copied());
                    }
                }
            }
        }
    }
}

/// Standalone context for using the reactive graph outside the VM.
pub struct Detached<V>(PhantomData<V>);

impl<V> Default for Detached<V> {
    fn default() -> Self {
        Self(PhantomData)
    }
}

impl<V> fmt::Debug for Detached<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Detached")
    }
}

impl<V: Clone + PartialEq + fmt::Debug> Context for Detached<V> {
    type Value = V;
    type Error = ReactiveError;
}

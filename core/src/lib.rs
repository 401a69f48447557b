//! # Gigbook Core
//!
//! The functional core the booking engine is written against.
//!
//! Every booking state change is expressed as a **reducer**: a function that
//! takes the current state, an action and the injected environment, mutates
//! the state in place and returns **effects**. Effects are descriptions of
//! work (for Gigbook that is almost always "enqueue this notification"), and
//! the orchestrating shell decides when to run them.
//!
//! ## Core Concepts
//!
//! - **State**: the aggregate being changed (a single booking's lifecycle)
//! - **Action**: commands (`Accept`, `Cancel`, ...) and the events they produce
//! - **Reducer**: `(State, Action, Environment) → (State, Effects)`
//! - **Effect**: side effect descriptions, executed by the caller
//! - **Environment**: injected dependencies (clock, dispatcher) behind traits
//!
//! ## Example
//!
//! ```ignore
//! use gigbook_core::{effect::Effect, reducer::Reducer, SmallVec};
//!
//! impl Reducer for LifecycleReducer {
//!     type State = LifecycleState;
//!     type Action = BookingAction;
//!     type Environment = LifecycleEnvironment;
//!
//!     fn reduce(
//!         &self,
//!         state: &mut LifecycleState,
//!         action: BookingAction,
//!         env: &LifecycleEnvironment,
//!     ) -> SmallVec<[Effect<BookingAction>; 4]> {
//!         SmallVec::new()
//!     }
//! }
//! ```

#![forbid(unsafe_code)]

pub use smallvec::{smallvec, SmallVec};

/// Reducer module - the trait every state machine in the workspace implements.
pub mod reducer {
    use super::effect::Effect;
    use smallvec::SmallVec;

    /// The Reducer trait - core abstraction for business logic
    ///
    /// Reducers never perform I/O. Anything that has to leave the process
    /// (notifications, persistence) is returned as an [`Effect`].
    pub trait Reducer {
        /// The state type this reducer operates on
        type State;

        /// The action type this reducer processes
        type Action;

        /// The environment type with injected dependencies
        type Environment;

        /// Reduce an action into state changes and effects
        ///
        /// 1. Validates the action against the current state
        /// 2. Updates state in place
        /// 3. Returns effect descriptions to be executed
        fn reduce(
            &self,
            state: &mut Self::State,
            action: Self::Action,
            env: &Self::Environment,
        ) -> SmallVec<[Effect<Self::Action>; 4]>;
    }
}

/// Effect module - side effect descriptions and their execution.
pub mod effect {
    use futures::future::BoxFuture;
    use std::future::Future;
    use std::pin::Pin;

    /// Effect type - describes a side effect to be executed
    ///
    /// Effects are NOT executed by the reducer. They are returned to the caller,
    /// which runs them with [`Effect::run`] once the state change that produced
    /// them has been persisted.
    pub enum Effect<Action> {
        /// No-op effect
        None,

        /// Run effects concurrently
        Parallel(Vec<Effect<Action>>),

        /// Run effects one after another, in order
        Sequential(Vec<Effect<Action>>),

        /// Arbitrary async computation
        ///
        /// Returns `Option<Action>` - if Some, the action is handed back to the caller
        Future(Pin<Box<dyn Future<Output = Option<Action>> + Send>>),
    }

    // Manual Debug implementation since Future doesn't implement Debug
    impl<Action> std::fmt::Debug for Effect<Action>
    where
        Action: std::fmt::Debug,
    {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            match self {
                Effect::None => write!(f, "Effect::None"),
                Effect::Parallel(effects) => {
                    f.debug_tuple("Effect::Parallel").field(effects).finish()
                },
                Effect::Sequential(effects) => {
                    f.debug_tuple("Effect::Sequential").field(effects).finish()
                },
                Effect::Future(_) => write!(f, "Effect::Future(<future>)"),
            }
        }
    }

    impl<Action> Effect<Action> {
        /// Combine effects to run in parallel
        #[must_use]
        pub const fn merge(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Parallel(effects)
        }

        /// Chain effects to run sequentially
        #[must_use]
        pub const fn chain(effects: Vec<Effect<Action>>) -> Effect<Action> {
            Effect::Sequential(effects)
        }

        /// Wrap an async block as an effect.
        pub fn future<F>(fut: F) -> Self
        where
            F: Future<Output = Option<Action>> + Send + 'static,
        {
            Effect::Future(Box::pin(fut))
        }
    }

    impl<Action> Effect<Action>
    where
        Action: Send + 'static,
    {
        /// Execute the effect, returning any feedback actions it produced.
        ///
        /// `Sequential` preserves order; `Parallel` runs its children
        /// concurrently and concatenates their feedback in declaration order.
        pub fn run(self) -> BoxFuture<'static, Vec<Action>> {
            Box::pin(async move {
                match self {
                    Effect::None => Vec::new(),
                    Effect::Future(fut) => fut.await.into_iter().collect(),
                    Effect::Sequential(effects) => {
                        let mut feedback = Vec::new();
                        for effect in effects {
                            feedback.extend(effect.run().await);
                        }
                        feedback
                    },
                    Effect::Parallel(effects) => {
                        futures::future::join_all(effects.into_iter().map(Effect::run))
                            .await
                            .into_iter()
                            .flatten()
                            .collect()
                    },
                }
            })
        }
    }

    /// Run a batch of effects returned by a reducer, in order.
    pub async fn run_all<Action, I>(effects: I) -> Vec<Action>
    where
        Action: Send + 'static,
        I: IntoIterator<Item = Effect<Action>>,
    {
        Effect::Sequential(effects.into_iter().collect()).run().await
    }
}

/// Environment module - dependency injection traits
pub mod environment {
    use chrono::{DateTime, Utc};

    /// Clock trait - abstracts time operations for testability
    ///
    /// The booking engine treats every timestamp as vendor-local wall-clock
    /// time; callers read `now().naive_utc()` as "now" on that wall clock.
    pub trait Clock: Send + Sync {
        /// Get the current time
        fn now(&self) -> DateTime<Utc>;
    }

    /// Production clock backed by the system time.
    #[derive(Debug, Clone, Copy, Default)]
    pub struct SystemClock;

    impl Clock for SystemClock {
        fn now(&self) -> DateTime<Utc> {
            Utc::now()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::effect::{run_all, Effect};
    use super::environment::{Clock, SystemClock};
    use super::{smallvec, SmallVec};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn sequential_effects_keep_declaration_order() {
        let effects = vec![
            Effect::future(async { Some(1) }),
            Effect::None,
            Effect::chain(vec![
                Effect::future(async { Some(2) }),
                Effect::future(async { Some(3) }),
            ]),
        ];

        assert_eq!(run_all(effects).await, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn parallel_effects_all_run() {
        let counter = Arc::new(AtomicUsize::new(0));
        let effects = (0..4)
            .map(|_| {
                let c = Arc::clone(&counter);
                Effect::<()>::future(async move {
                    c.fetch_add(1, Ordering::SeqCst);
                    None
                })
            })
            .collect();

        let feedback = Effect::merge(effects).run().await;

        assert!(feedback.is_empty());
        assert_eq!(counter.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn reexported_smallvec_holds_reducer_effects() {
        let effects: SmallVec<[Effect<u8>; 4]> =
            smallvec![Effect::future(async { Some(7) }), Effect::None];
        assert!(!effects.spilled());
        assert_eq!(run_all(effects.into_vec()).await, vec![7]);
    }

    #[test]
    fn system_clock_reads_chrono_utc() {
        let before = chrono::Utc::now();
        assert!(SystemClock.now() >= before);
    }
}

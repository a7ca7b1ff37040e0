//! Property-based test generators using proptest.
//!
//! Provides strategies over session inputs: events, stop policies,
//! partition values and user ids.

use proptest::prelude::*;
use proptest::test_runner::Config as ProptestConfig;
use tether_session::{PartitionValue, SessionEvent, StopPolicy, UserId};

/// Strategy for generating stop policies.
pub fn stop_policy_strategy() -> impl Strategy<Value = StopPolicy> {
    prop_oneof![
        Just(StopPolicy::Immediately),
        Just(StopPolicy::AfterChangesUploaded),
        Just(StopPolicy::Never),
    ]
}

/// Strategy for generating any state machine event.
pub fn session_event_strategy() -> impl Strategy<Value = SessionEvent> {
    prop_oneof![
        4 => any::<bool>().prop_map(|has_token| SessionEvent::Start { has_token }),
        3 => Just(SessionEvent::TokenAcquired),
        3 => any::<bool>().prop_map(|pending_uploads| SessionEvent::Stop { pending_uploads }),
        2 => Just(SessionEvent::UploadsDrained),
        2 => Just(SessionEvent::Logout),
        2 => Just(SessionEvent::Login),
        2 => any::<bool>().prop_map(|pending_uploads| SessionEvent::Close { pending_uploads }),
        1 => Just(SessionEvent::Fatal),
        1 => Just(SessionEvent::Shutdown),
    ]
}

/// Strategy for generating event sequences of up to `max_len` events.
pub fn event_sequence_strategy(max_len: usize) -> impl Strategy<Value = Vec<SessionEvent>> {
    prop::collection::vec(session_event_strategy(), 0..max_len)
}

/// Strategy for generating partition values of every kind.
pub fn partition_strategy() -> impl Strategy<Value = PartitionValue> {
    prop_oneof![
        "[a-zA-Z0-9 /._-]{0,24}".prop_map(PartitionValue::String),
        any::<i32>().prop_map(PartitionValue::Int32),
        any::<i64>().prop_map(PartitionValue::Int64),
        prop::array::uniform12(any::<u8>()).prop_map(PartitionValue::ObjectId),
    ]
}

/// Strategy for generating user ids.
pub fn user_id_strategy() -> impl Strategy<Value = UserId> {
    prop::string::string_regex("[a-z][a-z0-9@._-]{0,31}")
        .expect("Invalid regex")
        .prop_map(UserId::from)
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum number of shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Creates a configuration for thorough tests.
    #[must_use]
    pub fn thorough() -> Self {
        Self {
            cases: 1024,
            max_shrink_iters: 10000,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

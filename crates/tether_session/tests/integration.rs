//! Integration tests for sessions, user fan-out and client reset.

use std::fs;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tether_session::{
    AccessToken, ConnectMode, ConnectionListener, ConnectionState, Credentials, ErrorHandler,
    FatalError, Interrupter, PathStrategy, SessionConfig, SessionError, SessionErrorEvent,
    SessionState, StopPolicy, SyncSession,
};
use tether_testkit::prelude::*;

#[test]
fn logout_makes_every_bound_session_inactive() {
    let env = TestEnv::new();
    let (user, handles) = scenarios::user_with_sessions(&env, "alice", 3);
    for handle in &handles {
        assert_eq!(handle.session().state().unwrap(), SessionState::Active);
    }

    user.log_out();
    for handle in &handles {
        assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
        assert_eq!(
            handle.session().connection_state().unwrap(),
            ConnectionState::Disconnected
        );
    }
}

#[test]
fn logout_then_login_revives_to_active() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session();
    assert_eq!(session.state().unwrap(), SessionState::Active);

    env.manager.logout(user.id());
    assert_eq!(session.state().unwrap(), SessionState::Inactive);

    let again = env.login("alice");
    assert_eq!(again, user);
    assert_eq!(session.state().unwrap(), SessionState::Active);
    assert!(session.is_connected().unwrap());
    assert_eq!(session.stop_policy().unwrap(), StopPolicy::AfterChangesUploaded);
}

#[test]
fn login_revives_through_waiting_when_token_is_pending() {
    let env = TestEnv::with_manual_tokens();
    let user = env.manager.login(Credentials::new("alice").with_access_token(AccessToken::new("t1")));
    let handle = env.open(&user, "p");
    let session = handle.session();
    assert_eq!(session.state().unwrap(), SessionState::Active);

    user.log_out();
    env.login("alice");
    assert_eq!(session.state().unwrap(), SessionState::WaitingForAccessToken);

    env.manager
        .access_token_refreshed(user.id(), AccessToken::new("t2"));
    assert_eq!(session.state().unwrap(), SessionState::Active);
}

#[test]
fn explicitly_stopped_session_stays_stopped_after_login() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = env.open_with(
        &SessionConfig::new(&user, "p").with_stop_policy(StopPolicy::Immediately),
    );
    handle.session().stop().unwrap();

    user.log_out();
    env.login("alice");
    assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
}

#[test]
fn concurrent_logout_login_never_strands_sessions() {
    let env = TestEnv::new();
    let (user, handles) = scenarios::user_with_sessions(&env, "alice", 4);
    let manager = &env.manager;

    thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..50 {
                    manager.logout(user.id());
                    manager.login(Credentials::new("alice"));
                }
            });
        }
    });

    manager.login(Credentials::new("alice"));
    for handle in &handles {
        assert_eq!(handle.session().state().unwrap(), SessionState::Active);
        assert!(handle.session().is_connected().unwrap());
    }
}

#[test]
fn stop_immediately_is_idempotent() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = scenarios::active_session(&env, &user, StopPolicy::Immediately);
    let session = handle.session();

    session.stop().unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Inactive);
    session.stop().unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Inactive);
    assert_eq!(session.connection_state().unwrap(), ConnectionState::Disconnected);
}

#[test]
fn start_twice_is_a_no_op() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = scenarios::active_session(&env, &user, StopPolicy::Immediately);
    let session = handle.session();
    session.stop().unwrap();

    session.start().unwrap();
    session.start().unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Active);
    assert_eq!(env.transport.connects(session.id()).len(), 2);
}

#[test]
fn stop_with_pending_uploads_dies_then_settles() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session();
    let version = handle.commit().unwrap();

    session.stop().unwrap();
    assert_eq!(session.state().unwrap(), SessionState::Dying);

    env.events(session).upload_acknowledged(version);
    assert_eq!(session.state().unwrap(), SessionState::Inactive);
    assert_eq!(env.transport.disconnects(session.id()), 1);
}

#[test]
fn dying_session_is_not_revived_by_login() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session().clone();
    let path = handle.path().to_path_buf();
    let version = handle.commit().unwrap();
    let events = env.events(&session);

    drop(handle);
    assert_eq!(env.manager.session_count(), 1);

    env.manager.logout(user.id());
    env.login("alice");
    events.upload_acknowledged(version);

    assert!(env.manager.session(&path).is_none());
    assert_eq!(env.manager.session_count(), 0);
    assert_eq!(env.transport.connects(session.id()), vec![ConnectMode::Resume]);
    assert_eq!(env.transport.disconnects(session.id()), 1);
}

#[test]
fn closing_last_handle_closes_the_session() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session().clone();
    let listener: Arc<dyn ConnectionListener> = RecordingListener::new();

    drop(handle);
    let errors = [
        session.state().unwrap_err(),
        session.connection_state().unwrap_err(),
        session.is_connected().unwrap_err(),
        session.start().unwrap_err(),
        session.stop().unwrap_err(),
        session.add_connection_listener(listener).unwrap_err(),
        session.upload_all_local_changes(None).unwrap_err(),
        session.download_all_server_changes(None).unwrap_err(),
    ];
    for err in errors {
        assert!(err.is_session_closed(), "unexpected error: {err}");
    }

    assert_eq!(session.user_id(), user.id());
    assert!(session.path().starts_with(env.base_dir()));
}

#[test]
fn interruption_is_consumed_by_the_interrupted_call() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session();

    Interrupter::current().interrupt();
    let err = session.download_all_server_changes(None).unwrap_err();
    assert!(matches!(err, SessionError::Interrupted));
    assert!(!tether_session::interrupted());

    session.upload_all_local_changes(None).unwrap();
}

#[test]
fn interrupt_from_another_thread_unblocks_download() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session().clone();

    let waiter = thread::spawn(move || {
        let interrupter = Interrupter::current();
        let result = thread::scope(|scope| {
            scope.spawn(|| {
                thread::sleep(Duration::from_millis(20));
                interrupter.interrupt();
            });
            session.download_all_server_changes(None)
        });
        (result, tether_session::interrupted())
    });
    let (result, still_flagged) = waiter.join().unwrap();
    assert!(matches!(result, Err(SessionError::Interrupted)));
    assert!(!still_flagged);
}

#[test]
fn timeout_is_distinct_from_interruption() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    handle.commit().unwrap();

    let err = handle
        .session()
        .upload_all_local_changes(Some(Duration::from_millis(10)))
        .unwrap_err();
    assert!(matches!(err, SessionError::Timeout { .. }));
    assert!(err.is_retryable());
}

#[test]
fn download_waits_for_remote_changes() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session();

    let peer = download_later(env.events(session), 7, Duration::from_millis(10));
    session
        .download_all_server_changes(Some(Duration::from_secs(5)))
        .unwrap();
    peer.join().unwrap();
    assert_eq!(session.progress().unwrap().downloaded, 7);
}

#[test]
fn initial_download_blocks_open() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let config = SessionConfig::new(&user, "p").with_initial_download(Duration::from_millis(20));

    let err = env.manager.open(&config).unwrap_err();
    assert!(matches!(err, SessionError::Timeout { .. }));
    assert_eq!(env.manager.session_count(), 0);
}

#[test]
fn different_partitions_have_different_paths() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let a = env.open(&user, "partitionvalue1");
    let b = env.open(&user, "partitionvalue2");

    assert_ne!(a.path(), b.path());
    assert_ne!(a.session(), b.session());
    assert_eq!(a.session().user_id(), b.session().user_id());
}

#[test]
fn per_user_paths_share_one_session() {
    let env = TestEnv::with_config(|config| config.with_path_strategy(PathStrategy::PerUser));
    let user = env.login("alice");
    let a = env.open(&user, "partitionvalue1");
    let b = env.open(&user, "partitionvalue2");

    assert_eq!(a.path(), b.path());
    assert_eq!(a.session(), b.session());
}

#[test]
fn sessions_of_one_user_report_the_same_user() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let a = env.open(&user, "partitionvalue1");
    let b = env.open(&user, "partitionvalue2");

    assert_ne!(a.session(), b.session());
    assert_eq!(a.session().user_id(), b.session().user_id());
    let bound = a.session().user().unwrap();
    assert_eq!(bound.id(), user.id());
}

#[test]
fn connection_listeners_see_each_transition_once() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = scenarios::active_session(&env, &user, StopPolicy::Immediately);
    let session = handle.session();
    let listener = RecordingListener::new();
    assert!(session.add_connection_listener(listener.clone()).unwrap());
    assert!(!session.add_connection_listener(listener.clone()).unwrap());

    let events = env.events(session);
    events.connection_state_changed(ConnectionState::Connecting);
    events.connection_state_changed(ConnectionState::Connecting);
    events.connection_state_changed(ConnectionState::Connected);
    session.stop().unwrap();

    assert_eq!(
        listener.states(),
        vec![
            ConnectionState::Connecting,
            ConnectionState::Connected,
            ConnectionState::Disconnected
        ]
    );

    // late events from the transport do not reopen a stopped session
    events.connection_state_changed(ConnectionState::Connected);
    assert_eq!(session.connection_state().unwrap(), ConnectionState::Disconnected);
}

#[test]
fn listener_can_remove_itself_during_dispatch() {
    let env = TestEnv::quiet();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let session = handle.session().clone();

    let calls = Arc::new(AtomicUsize::new(0));
    let slot: Arc<parking_lot::Mutex<Option<Arc<dyn ConnectionListener>>>> = Arc::default();
    let listener: Arc<dyn ConnectionListener> = {
        let calls = Arc::clone(&calls);
        let slot = Arc::clone(&slot);
        let session = session.clone();
        Arc::new(move |_old: ConnectionState, _new: ConnectionState| {
            calls.fetch_add(1, Ordering::SeqCst);
            if let Some(me) = slot.lock().take() {
                assert!(session.remove_connection_listener(&me));
            }
        })
    };
    *slot.lock() = Some(Arc::clone(&listener));
    session.add_connection_listener(listener).unwrap();

    let events = env.events(&session);
    events.connection_state_changed(ConnectionState::Connecting);
    events.connection_state_changed(ConnectionState::Connected);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[test]
fn disabled_connection_callbacks_still_track_state() {
    let env = TestEnv::with_config(|config| config.with_connection_callbacks(false));
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let listener = RecordingListener::new();
    handle
        .session()
        .add_connection_listener(listener.clone())
        .unwrap();

    handle.session().stop().unwrap();
    handle.session().start().unwrap();
    assert!(handle.session().is_connected().unwrap());
    assert!(listener.changes().is_empty());
}

fn reset_env() -> (TestEnv, Arc<RecordingErrorHandler>, tether_session::LocalHandle) {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handler = RecordingErrorHandler::new();
    let mut config = SessionConfig::new(&user, "p");
    config.error_handler = Some(handler.clone() as Arc<dyn ErrorHandler>);
    let handle = env.open_with(&config);
    (env, handler, handle)
}

#[test]
fn client_reset_moves_file_and_downloads_afresh() {
    let (env, handler, handle) = reset_env();
    let session = handle.session().clone();
    let path = handle.path().to_path_buf();
    fs::write(&path, b"divergent").unwrap();

    env.events(&session).fatal_error(FatalError::ClientReset {
        original_path: path.clone(),
    });
    assert_eq!(handler.count(), 1);
    let event = handler.events().remove(0);
    let reset = event.as_client_reset().unwrap().clone();
    assert_eq!(reset.original_path(), path);
    assert!(path.exists());
    assert!(!reset.backup_path().exists());
    assert_eq!(session.state().unwrap(), SessionState::Inactive);
    assert!(matches!(
        event.to_error(),
        SessionError::FatalDivergence { .. }
    ));

    drop(handle);
    reset.execute().unwrap();
    assert!(!path.exists());
    assert_eq!(fs::read(reset.backup_path()).unwrap(), b"divergent");
    assert!(matches!(
        reset.execute().unwrap_err(),
        SessionError::IllegalState { .. }
    ));

    let user = env.login("alice");
    let fresh = env.open(&user, "p");
    assert_eq!(fresh.path(), path);
    assert_ne!(fresh.session(), &session);
    assert_eq!(
        env.transport.connects(fresh.session().id()),
        vec![ConnectMode::FreshDownload]
    );
    assert_eq!(fresh.session().state().unwrap(), SessionState::Active);
}

#[test]
fn client_reset_refuses_while_handle_is_open() {
    let (env, handler, handle) = reset_env();
    let path = handle.path().to_path_buf();
    env.manager.simulate_client_reset(handle.session());

    let event = handler.events().remove(0);
    let reset = event.as_client_reset().unwrap();
    let err = reset.execute().unwrap_err();
    assert!(matches!(err, SessionError::ResourceBusy { .. }));
    assert!(err.is_retryable());
    assert!(path.exists());
    assert!(!reset.backup_path().exists());

    drop(handle);
    reset.execute().unwrap();
    assert!(reset.backup_path().exists());
}

#[test]
fn client_reset_is_delivered_once() {
    let (env, handler, handle) = reset_env();
    env.manager.simulate_client_reset(handle.session());
    env.manager.simulate_client_reset(handle.session());
    assert_eq!(handler.count(), 1);

    // frozen: start does not revive it
    handle.session().start().unwrap();
    assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
}

#[test]
fn unhandled_client_reset_does_not_strand_the_path() {
    let env = TestEnv::new();
    let user = env.login("alice");
    let handle = env.open(&user, "p");
    let first = handle.session().clone();
    let path = handle.path().to_path_buf();

    env.manager.simulate_client_reset(&first);
    assert_eq!(first.state().unwrap(), SessionState::Inactive);

    drop(handle);
    assert!(env.manager.session(&path).is_none());

    let reopened = env.open(&user, "p");
    assert_ne!(reopened.session(), &first);
    assert_eq!(reopened.session().state().unwrap(), SessionState::Active);
    assert!(path.exists());
}

#[test]
fn other_fatal_errors_reach_the_handler() {
    let (env, handler, handle) = reset_env();
    env.events(handle.session()).fatal_error(FatalError::Other {
        code: 231,
        message: "bad changeset".into(),
    });

    assert_eq!(handle.session().state().unwrap(), SessionState::Inactive);
    match &handler.events()[..] {
        [SessionErrorEvent::Fatal { code, message }] => {
            assert_eq!(*code, 231);
            assert_eq!(message, "bad changeset");
        }
        other => panic!("unexpected events: {other:?}"),
    }
}

#[test]
fn panicking_error_handler_reaches_the_hook() {
    let hooked = Arc::new(AtomicUsize::new(0));
    let env = {
        let hooked = Arc::clone(&hooked);
        TestEnv::with_config(move |config| {
            config.with_unhandled_error_hook(move |_| {
                hooked.fetch_add(1, Ordering::SeqCst);
            })
        })
    };
    let user = env.login("alice");
    let second = RecordingErrorHandler::new();
    let config = SessionConfig::new(&user, "p").with_error_handler(
        |_: &SyncSession, _: &SessionErrorEvent| {
            panic!("handler failed");
        },
    );
    let handle = env.open_with(&config);
    handle.session().add_error_handler(second.clone()).unwrap();

    env.manager.simulate_client_reset(handle.session());
    assert_eq!(hooked.load(Ordering::SeqCst), 1);
    assert_eq!(second.count(), 1);
}

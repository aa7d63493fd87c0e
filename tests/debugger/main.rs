mod common;


use crate::common::{Fixture, TestHooks, TestInfo};
use gemstalker::debugger::{DebugSession, DebugSessionBuilder, Error, SessionState, StopReason};

const STOP_MESSAGE: &str = "error 2010: a Calculator does not understand #makeList";

/// Debug session attached to the suspended process of `fixture`.
fn attached(fixture: &Fixture, info: &TestInfo) -> DebugSession<TestHooks> {
    let mut debugger = DebugSessionBuilder::new()
        .with_hooks(TestHooks::new(info.clone()))
        .with_poll_config(common::fast_poll())
        .build(fixture.registry.clone());
    debugger
        .attach(fixture.session.id(), fixture.process, STOP_MESSAGE)
        .unwrap();
    debugger
}

#[test]
fn test_attach() {
    let fixture = Fixture::new();
    let info = TestInfo::default();
    let debugger = attached(&fixture, &info);

    assert_eq!(debugger.state(), SessionState::Stopped);
    assert_eq!(debugger.process(), Some(fixture.process));
    assert_eq!(
        info.last_stop(),
        Some((StopReason::Exception, STOP_MESSAGE.to_string()))
    );
}

#[test]
fn test_attach_unknown_session() {
    let fixture = Fixture::new();
    let mut debugger = DebugSessionBuilder::new().build(fixture.registry.clone());
    assert!(matches!(
        debugger.attach(99, fixture.process, ""),
        Err(Error::InvalidSession(99))
    ));
    assert_eq!(debugger.state(), SessionState::Unattached);
}

#[test]
fn test_attach_twice() {
    let fixture = Fixture::new();
    let info = TestInfo::default();
    let mut debugger = attached(&fixture, &info);
    assert!(matches!(
        debugger.attach(fixture.session.id(), fixture.process, ""),
        Err(Error::AlreadyAttached)
    ));
}

#[test]
fn test_disconnect_is_idempotent() {
    let fixture = Fixture::new();
    let info = TestInfo::default();
    let mut debugger = attached(&fixture, &info);

    debugger.disconnect();
    debugger.disconnect();

    assert_eq!(debugger.state(), SessionState::Detached);
    assert_eq!(debugger.process(), None);
    assert_eq!(fixture.gem.cleared_stacks(), vec![fixture.process]);
    assert!(matches!(debugger.stack_depth(), Err(Error::NotAttached)));
    assert_eq!(info.terminated.get(), 0);
}

#[test]
fn test_terminate() {
    let fixture = Fixture::new();
    let info = TestInfo::default();
    let mut debugger = attached(&fixture, &info);

    debugger.terminate();
    assert_eq!(info.terminated.get(), 1);
    debugger.terminate();
    assert_eq!(info.terminated.get(), 1);
}

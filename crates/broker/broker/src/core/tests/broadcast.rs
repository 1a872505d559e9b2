//! Tests for whole-buffer edits and UPDATE fan-out.

use codeshare_proto::{ErrorCode, ServerEvent};
use pretty_assertions::assert_eq;

use super::helpers::{TestBroker, TestConnection};
use crate::config::{EditPolicy, SessionPolicy};

fn unlocked_policy() -> SessionPolicy {
	SessionPolicy {
		edit_policy: EditPolicy::UnlockedOrHolder,
		..SessionPolicy::default()
	}
}

#[tokio::test(flavor = "current_thread")]
async fn holder_edit_reaches_other_watchers() {
	let broker = TestBroker::new(SessionPolicy::default());
	let core = &broker.core;
	let mut a = TestConnection::connect(core);
	let mut b = TestConnection::connect(core);
	let mut c = TestConnection::connect(core);

	core.open_file(a.conn, "x.py", None).unwrap();
	core.open_file(b.conn, "x.py", Some(false)).unwrap();

	core.edit_file(a.conn, "x.py", "print('v2')\n".into()).unwrap();

	assert_eq!(
		b.try_recv(),
		Some(ServerEvent::Update {
			filename: "x.py".into(),
			content: "print('v2')\n".into(),
		})
	);
	assert_eq!(a.try_recv(), None);
	assert_eq!(c.try_recv(), None);
	assert_eq!(broker.read("x.py"), "print('v2')\n");
	assert_eq!(core.cached_content("x.py").as_deref(), Some("print('v2')\n"));
}

#[tokio::test(flavor = "current_thread")]
async fn non_holder_edit_is_rejected_without_mutation() {
	let broker = TestBroker::new(SessionPolicy::default());
	let core = &broker.core;
	let mut a = TestConnection::connect(core);
	let b = TestConnection::connect(core);

	core.open_file(a.conn, "x.py", None).unwrap();
	core.open_file(b.conn, "x.py", Some(false)).unwrap();

	let err = core.edit_file(b.conn, "x.py", "hijack".into()).unwrap_err();
	assert_eq!(err.code(), ErrorCode::LockConflict);
	assert_eq!(a.try_recv(), None);
	assert_eq!(broker.read("x.py"), "print('v1')\n");
	assert_eq!(core.cached_content("x.py").as_deref(), Some("print('v1')\n"));
	assert_eq!(core.watchers_of("x.py"), vec![a.conn, b.conn]);
}

#[tokio::test(flavor = "current_thread")]
async fn holder_policy_rejects_unlocked_edit() {
	let broker = TestBroker::new(SessionPolicy::default());
	let core = &broker.core;
	let a = TestConnection::connect(core);

	core.open_file(a.conn, "shared.py", Some(false)).unwrap();
	let err = core.edit_file(a.conn, "shared.py", "v2".into()).unwrap_err();
	assert_eq!(err.code(), ErrorCode::LockConflict);
	assert_eq!(broker.read("shared.py"), "v1");
}

#[tokio::test(flavor = "current_thread")]
async fn unlocked_edit_reaches_watchers() {
	let broker = TestBroker::new(unlocked_policy());
	let core = &broker.core;
	let mut a = TestConnection::connect(core);
	let mut b = TestConnection::connect(core);

	core.open_file(a.conn, "shared.py", Some(false)).unwrap();
	core.open_file(b.conn, "shared.py", Some(false)).unwrap();

	core.edit_file(a.conn, "shared.py", "v2".into()).unwrap();
	assert_eq!(
		b.try_recv(),
		Some(ServerEvent::Update {
			filename: "shared.py".into(),
			content: "v2".into(),
		})
	);
	assert_eq!(a.try_recv(), None);
	assert_eq!(broker.read("shared.py"), "v2");
}

#[tokio::test(flavor = "current_thread")]
async fn unlocked_policy_still_respects_other_holder() {
	let broker = TestBroker::new(unlocked_policy());
	let core = &broker.core;
	let a = TestConnection::connect(core);
	let b = TestConnection::connect(core);

	core.open_file(a.conn, "shared.py", Some(true)).unwrap();
	let err = core.edit_file(b.conn, "shared.py", "v2".into()).unwrap_err();
	assert_eq!(err.code(), ErrorCode::LockConflict);
	assert_eq!(broker.read("shared.py"), "v1");
}

#[tokio::test(flavor = "current_thread")]
async fn edits_apply_in_send_order() {
	let broker = TestBroker::new(SessionPolicy::default());
	let core = &broker.core;
	let a = TestConnection::connect(core);
	let mut b = TestConnection::connect(core);

	core.open_file(a.conn, "x.py", None).unwrap();
	core.open_file(b.conn, "x.py", Some(false)).unwrap();
	for n in 1..=5 {
		core.edit_file(a.conn, "x.py", format!("v{n}")).unwrap();
	}

	let seen: Vec<String> = std::iter::from_fn(|| b.try_recv())
		.map(|event| match event {
			ServerEvent::Update { content, .. } => content,
			other => panic!("unexpected {other:?}"),
		})
		.collect();
	assert_eq!(seen, vec!["v1", "v2", "v3", "v4", "v5"]);
	assert_eq!(broker.read("x.py"), "v5");
}

#[tokio::test(flavor = "current_thread")]
async fn broadcast_can_be_disabled() {
	let broker = TestBroker::new(SessionPolicy {
		broadcast_edits: false,
		..SessionPolicy::default()
	});
	let core = &broker.core;
	let a = TestConnection::connect(core);
	let mut b = TestConnection::connect(core);

	core.open_file(a.conn, "x.py", None).unwrap();
	core.open_file(b.conn, "x.py", Some(false)).unwrap();
	core.edit_file(a.conn, "x.py", "quiet".into()).unwrap();

	assert_eq!(b.try_recv(), None);
	assert_eq!(broker.read("x.py"), "quiet");
}

#[tokio::test(flavor = "current_thread")]
async fn dead_watcher_is_unregistered() {
	let broker = TestBroker::new(SessionPolicy::default());
	let core = &broker.core;
	let a = TestConnection::connect(core);
	let b = TestConnection::connect(core);

	core.open_file(a.conn, "x.py", None).unwrap();
	core.open_file(b.conn, "x.py", Some(false)).unwrap();
	core.open_file(b.conn, "shared.py", None).unwrap();
	let b_conn = b.conn;
	drop(b);

	core.edit_file(a.conn, "x.py", "v2".into()).unwrap();

	assert!(!core.is_connected(b_conn));
	assert_eq!(core.watchers_of("x.py"), vec![a.conn]);
	assert_eq!(core.lock_holder("shared.py"), None);
	core.assert_file_state_consistent();
}

#[tokio::test(flavor = "current_thread")]
async fn edit_of_unknown_file_is_not_found() {
	let broker = TestBroker::new(unlocked_policy());
	let core = &broker.core;
	let a = TestConnection::connect(core);

	let err = core.edit_file(a.conn, "new.py", "x".into()).unwrap_err();
	assert_eq!(err.code(), ErrorCode::FileNotFound);
	assert!(!broker.path("new.py").exists());
}

use std::{panic, path::Path};

use proptest::prelude::*;
use wavelane_core::{
    Session, SessionOptions,
    fixtures::build_demo_session,
    persistence::{SessionFile, save_session},
};

/// Opens `path` in a fresh session. Returns false on panic, and also when a
/// failed open still left a document registered.
fn opens_cleanly(path: &Path) -> bool {
    panic::catch_unwind(|| {
        let session = Session::new(SessionOptions::default());
        match session.open(path) {
            Ok(id) => session.is_open(id),
            Err(_) => session.documents().is_empty() && session.active_document().is_none(),
        }
    })
    .unwrap_or(false)
}

fn saved_demo(path: &Path) -> Vec<u8> {
    let session = Session::new(SessionOptions::default());
    let demo = build_demo_session(&session).expect("demo session should build");
    let document = session.document(demo.multitrack).expect("demo document");
    let file = SessionFile::from_document(&document).expect("session file");
    save_session(path, &file).expect("saving the demo session should work");
    std::fs::read(path).expect("reading the saved session should work")
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 64,
        .. ProptestConfig::default()
    })]

    #[test]
    fn random_session_bytes_do_not_panic(raw in prop::collection::vec(any::<u8>(), 0..4096)) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_random.wlsx");
        std::fs::write(&path, raw).expect("writing random payload should work");
        prop_assert!(opens_cleanly(&path));
    }

    #[test]
    fn truncated_sessions_do_not_panic(prefix_len in 0usize..16384usize) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_truncated.wlsx");
        let mut payload = saved_demo(&path);
        payload.truncate(prefix_len.min(payload.len()));
        std::fs::write(&path, payload).expect("writing truncated payload should work");
        prop_assert!(opens_cleanly(&path));
    }

    #[test]
    fn mutated_sessions_do_not_panic(index in 0usize..16384usize, delta in any::<u8>()) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_mutated.wlsx");
        let mut payload = saved_demo(&path);
        if !payload.is_empty() {
            let target = index % payload.len();
            payload[target] ^= delta.max(1);
        }
        std::fs::write(&path, payload).expect("writing mutated payload should work");
        prop_assert!(opens_cleanly(&path));
    }

    #[test]
    fn random_wav_bytes_do_not_panic(raw in prop::collection::vec(any::<u8>(), 0..2048)) {
        let temp = tempfile::tempdir().expect("tempdir should be creatable");
        let path = temp.path().join("corrupt_random.wav");
        std::fs::write(&path, raw).expect("writing random payload should work");
        prop_assert!(opens_cleanly(&path));
    }
}

#[test]
fn intact_sessions_still_open() {
    let temp = tempfile::tempdir().expect("tempdir should be creatable");
    let path = temp.path().join("demo.wlsx");
    saved_demo(&path);

    let session = Session::new(SessionOptions::default());
    let id = session.open(&path).expect("intact session opens");
    assert_eq!(session.tracks(id).expect("tracks").len(), 4);
    assert_eq!(session.markers(id).expect("markers").len(), 2);
}

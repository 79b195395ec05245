//! Shared segment integration tests. Object names are suffixed with the
//! test pid so parallel runs on one host cannot collide.

use std::fs;

use aep_state::SharedState;

struct Names {
    shm: String,
    sem: String,
}

impl Names {
    fn new(tag: &str) -> Names {
        let pid = std::process::id();
        Names {
            shm: format!("/aep_test_{tag}_{pid}"),
            sem: format!("/aep_test_{tag}_{pid}_sem"),
        }
    }
}

impl Drop for Names {
    fn drop(&mut self) {
        SharedState::unlink_named(&self.shm, &self.sem);
    }
}

#[test]
fn counter_and_refs_round_trip() {
    let names = Names::new("rt");
    let dir = tempfile::tempdir().unwrap();
    let state = SharedState::open_named(&names.shm, &names.sem, dir.path()).unwrap();

    assert_eq!(state.cache_size(), 0);
    assert_eq!(state.add_cache_size(1000), 1000);
    assert_eq!(state.add_cache_size(-400), 600);
    assert_eq!(state.cache_size(), 600);

    assert_eq!(state.ref_count("/a/b"), 0);
    assert_eq!(state.ref_add("/a/b", 1), 1);
    assert_eq!(state.ref_add("/a/b", 1), 2);
    assert_eq!(state.ref_add("/a/b", -1), 1);
    assert_eq!(state.ref_add("/a/b", -1), 0);
    // Floors at zero instead of wrapping.
    assert_eq!(state.ref_add("/a/b", -1), 0);
}

#[test]
fn winner_seeds_counter_from_cache_root() {
    let names = Names::new("seed");
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("x")).unwrap();
    fs::write(dir.path().join("x/f1"), vec![0u8; 300]).unwrap();
    fs::write(dir.path().join("f2"), vec![0u8; 700]).unwrap();

    let state = SharedState::open_named(&names.shm, &names.sem, dir.path()).unwrap();
    assert_eq!(state.cache_size(), 1000);
}

#[test]
fn loser_sees_the_existing_segment() {
    let names = Names::new("race");
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("seeded"), vec![0u8; 123]).unwrap();

    let winner = SharedState::open_named(&names.shm, &names.sem, dir.path()).unwrap();
    assert_eq!(winner.cache_size(), 123);
    winner.add_cache_size(77);

    // Second open must not rescan or zero; the empty dir would reset to 0.
    let empty = tempfile::tempdir().unwrap();
    let loser = SharedState::open_named(&names.shm, &names.sem, empty.path()).unwrap();
    assert_eq!(loser.cache_size(), 200);

    // Both views are the same memory.
    loser.ref_add("/shared", 1);
    assert_eq!(winner.ref_count("/shared"), 1);
}


use rollnet::{PlayerType, RollnetError};
use stubs::{GameStub, RandomChecksumGameStub, INPUT_SIZE};

#[test]
fn test_create_session() {
    assert!(rollnet::start_synctest_session(2, INPUT_SIZE, 2).is_ok());
    // check distances spanning the entire prediction window are not allowed
    assert!(rollnet::start_synctest_session(2, INPUT_SIZE, 8).is_err());
}

#[test]
fn test_advance_frame_before_start() -> Result<(), RollnetError> {
    let mut sess = rollnet::start_synctest_session(2, INPUT_SIZE, 2)?;
    let input = bincode::serialize(&0u32).unwrap();
    assert!(matches!(
        sess.advance_frame(0, &input),
        Err(RollnetError::NotSynchronized)
    ));
    Ok(())
}

#[test]
fn test_add_player() -> Result<(), RollnetError> {
    let mut sess = rollnet::start_synctest_session(2, INPUT_SIZE, 2)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Local, 1)?;
    assert!(matches!(
        sess.add_player(PlayerType::Local, 3),
        Err(RollnetError::PlayerOutOfRange)
    ));
    let remote_addr = "127.0.0.1:8080".parse().unwrap();
    assert!(matches!(
        sess.add_player(PlayerType::Remote(remote_addr), 1),
        Err(RollnetError::InvalidRequest { .. })
    ));
    Ok(())
}

#[test]
fn test_advance_frame_with_rollbacks() -> Result<(), RollnetError> {
    let check_distance = 7;
    let mut stub = GameStub::new();
    let mut sess = rollnet::start_synctest_session(2, INPUT_SIZE, check_distance)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Local, 1)?;
    sess.start_session()?;

    for i in 0..200u32 {
        let input = bincode::serialize(&i).unwrap();
        let requests = sess.advance_frame(0, &input)?;
        stub.handle_requests(requests);
        assert_eq!(stub.gs.frame, i as i32 + 1); // frame should have advanced
    }

    Ok(())
}

#[test]
fn test_advance_frames_with_delayed_input() -> Result<(), RollnetError> {
    let check_distance = 7;
    let mut stub = GameStub::new();
    let mut sess = rollnet::start_synctest_session(2, INPUT_SIZE, check_distance)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Local, 1)?;
    sess.set_frame_delay(2, 0)?;
    sess.start_session()?;

    for i in 0..200u32 {
        let input = bincode::serialize(&i).unwrap();
        let requests = sess.advance_frame(0, &input)?;
        stub.handle_requests(requests);
        assert_eq!(stub.gs.frame, i as i32 + 1); // frame should have advanced
    }

    Ok(())
}

#[test]
#[should_panic]
fn test_advance_frames_with_random_checksums() {
    let check_distance = 2;
    let mut stub = RandomChecksumGameStub::new();
    let mut sess = rollnet::start_synctest_session(2, INPUT_SIZE, check_distance).unwrap();
    sess.add_player(PlayerType::Local, 0).unwrap();
    sess.add_player(PlayerType::Local, 1).unwrap();
    sess.start_session().unwrap();

    // since the stub reports a random checksum on every save, the resimulation comparison must fail
    for i in 0..200u32 {
        let input = bincode::serialize(&i).unwrap();
        let requests = sess.advance_frame(0, &input).unwrap();
        stub.handle_requests(requests);
    }
}

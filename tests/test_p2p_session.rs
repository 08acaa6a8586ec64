
use rollnet::{PlayerType, RollnetError, RollnetEvent, SessionState};
use serial_test::serial;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use stubs::{GameStub, INPUT_SIZE};

#[test]
#[serial]
fn test_add_players() -> Result<(), RollnetError> {
    let remote_addr1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
    let remote_addr2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8081);
    let remote_addr3 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8082);
    let spec_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8090);

    let mut sess = rollnet::start_p2p_session(4, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Remote(remote_addr1), 1)?;
    sess.add_player(PlayerType::Remote(remote_addr2), 2)?;
    sess.add_player(PlayerType::Remote(remote_addr3), 3)?;
    let spec_handle = sess.add_player(PlayerType::Spectator(spec_addr), 4)?;
    assert_eq!(spec_handle, 1004);

    // player handles above the player count are rejected
    let remote_addr4 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8083);
    assert_eq!(
        sess.add_player(PlayerType::Remote(remote_addr4), 4),
        Err(RollnetError::PlayerOutOfRange)
    );
    // duplicate handles are rejected
    assert!(sess.add_player(PlayerType::Remote(remote_addr4), 1).is_err());
    // only one local player is allowed
    assert!(sess.add_player(PlayerType::Local, 2).is_err());
    Ok(())
}

#[test]
#[serial]
fn test_start_session_with_missing_player() -> Result<(), RollnetError> {
    let mut sess = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    assert!(sess.start_session().is_err());
    Ok(())
}

#[test]
#[serial]
fn test_add_player_after_start() -> Result<(), RollnetError> {
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
    let spec_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8090);

    let mut sess = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Remote(remote_addr), 1)?;
    sess.start_session()?;

    // once the session synchronizes, the player list is fixed, spectators included
    assert!(matches!(
        sess.add_player(PlayerType::Spectator(spec_addr), 2),
        Err(RollnetError::InvalidRequest { .. })
    ));
    Ok(())
}

#[test]
#[serial]
fn test_disconnect_player() -> Result<(), RollnetError> {
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);
    let spec_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8090);

    let mut sess = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Remote(remote_addr), 1)?;
    sess.add_player(PlayerType::Spectator(spec_addr), 2)?;
    sess.start_session()?;

    assert_eq!(sess.disconnect_player(5), Err(RollnetError::InvalidHandle));
    // local players cannot be disconnected
    assert!(matches!(
        sess.disconnect_player(0),
        Err(RollnetError::InvalidRequest { .. })
    ));
    assert!(sess.disconnect_player(1).is_ok());
    // a player can only be disconnected once
    assert_eq!(
        sess.disconnect_player(1),
        Err(RollnetError::PlayerDisconnected)
    );
    assert!(sess.disconnect_player(1002).is_ok());

    Ok(())
}

#[test]
#[serial]
fn test_synchronize_p2p_sessions() -> Result<(), RollnetError> {
    let addr1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 7777);
    let addr2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8888);

    let mut sess1 = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess1.add_player(PlayerType::Local, 0)?;
    sess1.add_player(PlayerType::Remote(addr2), 1)?;

    let mut sess2 = rollnet::start_p2p_session(2, INPUT_SIZE, 8888)?;
    sess2.add_player(PlayerType::Local, 1)?;
    sess2.add_player(PlayerType::Remote(addr1), 0)?;

    assert_eq!(sess1.current_state(), SessionState::Initializing);
    sess1.start_session()?;
    sess2.start_session()?;
    assert_eq!(sess1.current_state(), SessionState::Synchronizing);
    assert_eq!(sess2.current_state(), SessionState::Synchronizing);

    for _ in 0..50 {
        sess1.poll_remote_clients();
        sess2.poll_remote_clients();
    }

    assert_eq!(sess1.current_state(), SessionState::Running);
    assert_eq!(sess2.current_state(), SessionState::Running);

    // the handshake must have produced connect, sync progress and a running notification
    let events: Vec<RollnetEvent> = sess1.events().collect();
    assert!(events.contains(&RollnetEvent::Connected { player_handle: 1 }));
    assert!(events.contains(&RollnetEvent::Synchronized { player_handle: 1 }));
    assert!(events.contains(&RollnetEvent::Running));
    assert!(events
        .iter()
        .any(|e| matches!(e, RollnetEvent::Synchronizing { player_handle: 1, .. })));

    Ok(())
}

#[test]
#[serial]
fn test_advance_frame_p2p_sessions() -> Result<(), RollnetError> {
    let addr1 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 7777);
    let addr2 = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8888);

    let mut sess1 = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess1.add_player(PlayerType::Local, 0)?;
    sess1.add_player(PlayerType::Remote(addr2), 1)?;

    let mut sess2 = rollnet::start_p2p_session(2, INPUT_SIZE, 8888)?;
    sess2.add_player(PlayerType::Remote(addr1), 0)?;
    sess2.add_player(PlayerType::Local, 1)?;

    sess1.start_session()?;
    sess2.start_session()?;

    let mut stub1 = GameStub::new();
    let mut stub2 = GameStub::new();

    for i in 0..200u32 {
        sess1.poll_remote_clients();
        sess2.poll_remote_clients();

        if sess1.current_state() != SessionState::Running
            || sess2.current_state() != SessionState::Running
        {
            continue;
        }

        let input = bincode::serialize(&i).unwrap();
        match sess1.advance_frame(0, &input) {
            Ok(requests) => stub1.handle_requests(requests),
            Err(RollnetError::PredictionThreshold) => (),
            Err(err) => return Err(err),
        }
        match sess2.advance_frame(1, &input) {
            Ok(requests) => stub2.handle_requests(requests),
            Err(RollnetError::PredictionThreshold) => (),
            Err(err) => return Err(err),
        }
    }

    // both clients should have advanced deep into the game
    assert!(stub1.gs.frame > 50);
    assert!(stub2.gs.frame > 50);

    Ok(())
}

#[test]
#[serial]
fn test_network_stats_before_synchronization() -> Result<(), RollnetError> {
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);

    let mut sess = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Remote(remote_addr), 1)?;

    // no stats for the local player or before the connection is established
    assert!(matches!(
        sess.network_stats(0),
        Err(RollnetError::InvalidRequest { .. })
    ));
    assert!(matches!(
        sess.network_stats(1),
        Err(RollnetError::NotSynchronized)
    ));
    Ok(())
}

#[test]
#[serial]
fn test_frame_delay_only_for_local_players() -> Result<(), RollnetError> {
    let remote_addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1)), 8080);

    let mut sess = rollnet::start_p2p_session(2, INPUT_SIZE, 7777)?;
    sess.add_player(PlayerType::Local, 0)?;
    sess.add_player(PlayerType::Remote(remote_addr), 1)?;

    assert!(sess.set_frame_delay(2, 0).is_ok());
    assert!(sess.set_frame_delay(2, 1).is_err());
    assert_eq!(sess.set_frame_delay(2, 5), Err(RollnetError::InvalidHandle));
    Ok(())
}

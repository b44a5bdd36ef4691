use std::collections::HashSet;
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use super::*;
use crate::config::{HostConfig, HostFlowControl};
use crate::hci::acl::{IsoHeader, PacketBoundary};
use crate::l2cap::constants::L2CAP_ATT_CID;
use crate::l2cap::{ChanRef, ChannelOps, L2capResult};
use crate::testing::*;

type Events = Arc<Mutex<Vec<ConnEvent>>>;

fn record_events(host: &mut Host<MockController>) -> Events {
    let events = Events::default();
    let sink = events.clone();
    host.register_conn_callback(Box::new(move |event| sink.lock().unwrap().push(event.clone())));
    events
}

type Sent = Arc<Mutex<Vec<std::result::Result<(), String>>>>;

/// Fixed channel owner that only records send completions
struct SentLog(Sent);

impl ChannelOps for SentLog {
    fn sent(&mut self, _chan: ChanRef, result: std::result::Result<(), Error>) {
        self.0.lock().unwrap().push(result.map_err(|e| e.to_string()));
    }
}

fn att_channel(host: &mut Host<MockController>) -> Sent {
    let sent = Sent::default();
    let sink = sent.clone();
    host.l2cap()
        .register_fixed_channel(
            L2CAP_ATT_CID,
            Box::new(move |_| Some(Box::new(SentLog(sink.clone())) as Box<dyn ChannelOps>)),
        )
        .unwrap();
    sent
}

fn peer(last: u8) -> LeAddr {
    LeAddr::public([last, 0xBB, 0xCC, 0xDD, 0xEE, 0xFF])
}

/// Let a peer connect to us and return the connection
fn accept_link(host: &mut Host<MockController>, handle: u16, last: u8) -> ConnRef {
    deliver(host, &[le_conn_complete(handle, ROLE_PERIPHERAL, &peer(last))]);
    host.conn_by_handle(handle).unwrap()
}

fn acl_handles(host: &mut Host<MockController>) -> Vec<u16> {
    host.driver_mut()
        .take_acl()
        .into_iter()
        .map(|(header, _)| header.handle)
        .collect()
}

#[test]
fn test_pool_allocation_is_exclusive() {
    const THREADS: usize = 8;
    let pool = ConnPool::new(4);
    let claimed = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let pool = pool.clone();
            let claimed = claimed.clone();
            thread::spawn(move || {
                let conn = pool.allocate().ok();
                let id = conn.as_ref().map(ConnRef::id);
                // Hold every claimed slot until all threads tried.
                claimed.wait();
                drop(conn);
                id
            })
        })
        .collect();

    let ids: Vec<ConnId> = workers
        .into_iter()
        .filter_map(|w| w.join().unwrap())
        .collect();
    assert_eq!(ids.len(), 4);
    let unique: HashSet<u16> = ids.iter().map(|id| id.index).collect();
    assert_eq!(unique.len(), 4);

    assert_eq!(pool.in_use(), 0);
    let mut recycled = pool.take_recycled();
    recycled.sort();
    let mut expected = ids.clone();
    expected.sort();
    assert_eq!(recycled, expected);
}

#[test]
fn test_pool_churn_under_contention() {
    let pool = ConnPool::new(3);
    let workers: Vec<_> = (0..6)
        .map(|_| {
            let pool = pool.clone();
            thread::spawn(move || {
                let mut got = 0;
                for _ in 0..500 {
                    if let Ok(conn) = pool.allocate() {
                        assert!(pool.in_use() <= 3);
                        let extra = conn.clone();
                        assert!(extra.ref_count() >= 2);
                        conn.lock().err = 1;
                        got += 1;
                    }
                }
                got
            })
        })
        .collect();
    let total: usize = workers.into_iter().map(|w| w.join().unwrap()).sum();

    assert!(total > 0);
    assert_eq!(pool.in_use(), 0);
    assert_eq!(pool.take_recycled().len(), total);
    // Recycled slots come back reset.
    let conn = pool.allocate().unwrap();
    assert_eq!(conn.lock().err, 0);
}

#[test]
fn test_pool_exhaustion() {
    let pool = ConnPool::new(2);
    let _a = pool.allocate().unwrap();
    let _b = pool.allocate().unwrap();
    assert!(matches!(pool.allocate(), Err(Error::ResourceExhausted(_))));
}

#[test]
fn test_stale_id_does_not_resolve() {
    let pool = ConnPool::new(1);
    let conn = pool.allocate().unwrap();
    let old = conn.id();
    let second = pool.get(old).unwrap();
    assert_eq!(conn.ref_count(), 2);
    drop(conn);
    assert!(pool.get(old).is_some());
    drop(second);

    assert!(pool.get(old).is_none());
    let fresh = pool.allocate().unwrap();
    assert_eq!(fresh.id().index, old.index);
    assert_eq!(fresh.id().generation, old.generation + 1);
    assert!(pool.get(old).is_none());
    assert_eq!(pool.get(fresh.id()).unwrap(), fresh);
}

#[test]
fn test_state_transition_table() {
    use ConnState::*;

    let allowed = [
        (Disconnected, Initiating),
        (Disconnected, AdvConnectable),
        (ScanBeforeInitiating, Initiating),
        (Initiating, Connected),
        (Initiating, Disconnected),
        (AdvDirConnectable, Connected),
        (Connected, Disconnecting),
        (Connected, DisconnectComplete),
        (Disconnecting, DisconnectComplete),
        (DisconnectComplete, Disconnected),
    ];
    for (from, to) in allowed {
        assert!(from.can_transition(to), "{} -> {}", from, to);
    }

    let refused = [
        (Disconnected, Connected),
        (Disconnected, Disconnecting),
        (Connected, Initiating),
        (Connected, Disconnected),
        (AdvConnectable, Disconnecting),
        (DisconnectComplete, Connected),
        (ScanBeforeInitiating, Connected),
    ];
    for (from, to) in refused {
        assert!(!from.can_transition(to), "{} -> {}", from, to);
    }

    assert!(Initiating.is_pending());
    assert!(!Connected.is_pending());
    assert!(Disconnecting.has_handle());
    assert!(!DisconnectComplete.has_handle());
}

#[test]
fn test_same_state_transition_has_no_side_effects() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);
    assert_eq!(events.lock().unwrap().len(), 1);

    host.set_state(&conn, ConnState::Connected).unwrap();
    assert_eq!(events.lock().unwrap().len(), 1);

    assert!(matches!(
        host.set_state(&conn, ConnState::Initiating),
        Err(Error::InvalidState)
    ));
    assert_eq!(conn.lock().state, ConnState::Connected);
}

#[test]
fn test_refused_transition_reported() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = host.conns.allocate().unwrap();

    assert!(!host.set_state_logged(&conn, ConnState::Connected));
    assert_eq!(conn.lock().state, ConnState::Disconnected);
    assert!(events.lock().unwrap().is_empty());

    let conn = accept_link(&mut host, 0x40, 1);
    assert!(!host.set_state_logged(&conn, ConnState::Disconnected));
    assert_eq!(conn.lock().state, ConnState::Connected);
    assert!(host.set_state_logged(&conn, ConnState::Disconnecting));
}

#[test]
fn test_central_connect_and_disconnect() {
    let mut host = host();
    let events = record_events(&mut host);

    let conn = host
        .conn_le_create(peer(1), CreateParams::default(), ConnParams::default())
        .unwrap();
    let id = conn.id();
    assert_eq!(conn.lock().state, ConnState::Initiating);
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::LeCreateConnection { .. }))
            .len(),
        1
    );

    deliver(&mut host, &[le_conn_complete(0x40, ROLE_CENTRAL, &peer(1))]);
    {
        let c = conn.lock();
        assert_eq!(c.state, ConnState::Connected);
        assert_eq!(c.handle, Some(0x40));
        assert_eq!(c.role, Role::Central);
        assert_eq!(c.interval, 0x0028);
    }
    assert!(host
        .driver()
        .sent(|c| *c == HciCommand::LeReadRemoteFeatures { handle: 0x40 })
        .len()
        == 1);

    host.disconnect(id, HCI_ERR_REMOTE_USER_TERM_CONN).unwrap();
    assert_eq!(conn.lock().state, ConnState::Disconnecting);
    deliver(&mut host, &[disconn_complete(0x40, HCI_ERR_LOCALHOST_TERM_CONN)]);
    assert_eq!(conn.lock().state, ConnState::Disconnected);
    assert!(host.conn_by_handle(0x40).is_none());

    // Our reference keeps the slot until it goes.
    assert!(host.conn_get(id).is_some());
    drop(conn);
    host.process();
    assert!(host.conn_get(id).is_none());

    let events = events.lock().unwrap();
    assert_eq!(
        *events,
        vec![
            ConnEvent::Connected { conn: id, status: 0 },
            ConnEvent::Disconnected {
                conn: id,
                reason: HCI_ERR_LOCALHOST_TERM_CONN
            },
            ConnEvent::Recycled { conn: id },
        ]
    );
}

#[test]
fn test_single_initiator() {
    let mut host = host();
    let _first = host
        .conn_le_create(peer(1), CreateParams::default(), ConnParams::default())
        .unwrap();
    assert!(matches!(
        host.conn_le_create(peer(2), CreateParams::default(), ConnParams::default()),
        Err(Error::Already)
    ));
}

#[test]
fn test_create_rejects_bad_params() {
    let mut host = host();
    let params = ConnParams {
        interval_min: 0x0030,
        interval_max: 0x0020,
        ..ConnParams::default()
    };
    assert!(matches!(
        host.conn_le_create(peer(1), CreateParams::default(), params),
        Err(Error::InvalidParameter(_))
    ));
    let short_timeout = ConnParams {
        interval_min: 0x0C80,
        interval_max: 0x0C80,
        latency: 0,
        timeout: 0x0320,
    };
    assert!(short_timeout.validate().is_err());
    assert_eq!(host.conns().in_use(), 0);
}

#[test]
fn test_create_command_failure_releases_object() {
    let mut host = host();
    let events = record_events(&mut host);
    host.driver_mut()
        .fail_next(opcode(OGF_LE, OCF_LE_CREATE_CONN), HCI_ERR_INSUFFICIENT_RESOURCES);

    let result = host.conn_le_create(peer(1), CreateParams::default(), ConnParams::default());
    assert!(result.is_err());
    host.process();
    assert_eq!(host.conns().in_use(), 0);
    // The caller saw the error; no connected callback on top of it.
    assert!(!events
        .lock()
        .unwrap()
        .iter()
        .any(|e| matches!(e, ConnEvent::Connected { .. })));
}

#[test]
fn test_create_times_out() {
    let mut host = host();
    let events = record_events(&mut host);
    let create = CreateParams {
        timeout: Some(Duration::from_secs(1)),
        ..CreateParams::default()
    };
    let conn = host
        .conn_le_create(peer(1), create, ConnParams::default())
        .unwrap();
    let id = conn.id();
    drop(conn);

    host.process_timeouts(Instant::now() + Duration::from_secs(2));
    assert_eq!(
        host.driver()
            .sent(|c| *c == HciCommand::LeCreateConnectionCancel)
            .len(),
        1
    );

    // The controller reports the cancelled attempt.
    deliver(
        &mut host,
        &[le_conn_complete_status(
            HCI_ERR_UNKNOWN_CONN_ID,
            0,
            ROLE_CENTRAL,
            &peer(1),
        )],
    );
    assert!(host.conn_get(id).is_none());
    assert_eq!(
        *events.lock().unwrap(),
        vec![
            ConnEvent::Connected {
                conn: id,
                status: HCI_ERR_UNKNOWN_CONN_ID
            },
            ConnEvent::Recycled { conn: id },
        ]
    );
}

#[test]
fn test_user_cancel_reports_reason() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = host
        .conn_le_create(peer(1), CreateParams::default(), ConnParams::default())
        .unwrap();
    let id = conn.id();

    host.disconnect(id, HCI_ERR_LOCALHOST_TERM_CONN).unwrap();
    // A second cancel is not sent twice.
    host.disconnect(id, HCI_ERR_LOCALHOST_TERM_CONN).unwrap();
    assert_eq!(
        host.driver()
            .sent(|c| *c == HciCommand::LeCreateConnectionCancel)
            .len(),
        1
    );

    deliver(
        &mut host,
        &[le_conn_complete_status(
            HCI_ERR_UNKNOWN_CONN_ID,
            0,
            ROLE_CENTRAL,
            &peer(1),
        )],
    );
    assert_eq!(conn.lock().state, ConnState::Disconnected);
    assert_eq!(
        events.lock().unwrap()[0],
        ConnEvent::Connected {
            conn: id,
            status: HCI_ERR_LOCALHOST_TERM_CONN
        }
    );
}

#[test]
fn test_unexpected_central_link_rejected() {
    let mut host = host();
    deliver(&mut host, &[le_conn_complete(0x40, ROLE_CENTRAL, &peer(1))]);
    assert_eq!(host.conns().in_use(), 0);
    assert_eq!(
        host.driver()
            .sent(|c| *c
                == HciCommand::Disconnect {
                    handle: 0x40,
                    reason: HCI_ERR_REMOTE_USER_TERM_CONN
                })
            .len(),
        1
    );
}

#[test]
fn test_peripheral_link_rejected_when_pool_full() {
    let config = HostConfig {
        max_conn: 1,
        ..HostConfig::default()
    };
    let mut host = host_with(MockController::default(), config);
    let _first = accept_link(&mut host, 0x40, 1);

    deliver(&mut host, &[le_conn_complete(0x41, ROLE_PERIPHERAL, &peer(2))]);
    assert!(host.conn_by_handle(0x41).is_none());
    assert_eq!(
        host.driver()
            .sent(|c| *c
                == HciCommand::Disconnect {
                    handle: 0x41,
                    reason: HCI_ERR_REMOTE_LOW_RESOURCES
                })
            .len(),
        1
    );
}

#[test]
fn test_completed_packets_return_credits() {
    let mut host = host();
    let sent = att_channel(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);
    let id = conn.id();

    for i in 0..6u8 {
        host.l2cap().send(id, L2CAP_ATT_CID, vec![i; 10]).unwrap();
    }
    host.process();
    assert_eq!(acl_handles(&mut host).len(), 4);
    assert_eq!(host.credits.for_kind(ConnType::Le).available(), 0);
    assert_eq!(conn.lock().in_flight(), 4);
    assert!(sent.lock().unwrap().is_empty());

    deliver(&mut host, &[num_completed(0x40, 2)]);
    assert_eq!(sent.lock().unwrap().len(), 2);
    assert_eq!(acl_handles(&mut host).len(), 2);

    deliver(&mut host, &[num_completed(0x40, 4)]);
    host.process();
    assert_eq!(host.credits.for_kind(ConnType::Le).available(), 4);
    assert_eq!(*sent.lock().unwrap(), vec![Ok(()); 6]);
}

#[test]
fn test_round_robin_between_connections() {
    let controller = MockController {
        le_acl_pkts: 16,
        ..MockController::default()
    };
    let config = HostConfig {
        acl_tx_contexts: 16,
        ..HostConfig::default()
    };
    let mut host = host_with(controller, config);
    att_channel(&mut host);
    let a = accept_link(&mut host, 0x40, 1);
    let b = accept_link(&mut host, 0x41, 2);

    for _ in 0..3 {
        host.l2cap().send(a.id(), L2CAP_ATT_CID, vec![0xA; 8]).unwrap();
    }
    for _ in 0..2 {
        host.l2cap().send(b.id(), L2CAP_ATT_CID, vec![0xB; 8]).unwrap();
    }
    host.process();

    assert_eq!(acl_handles(&mut host), vec![0x40, 0x41, 0x40, 0x41, 0x40]);
}

#[test]
fn test_long_pdu_is_fragmented() {
    let mut host = host();
    att_channel(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);

    // 4 header bytes + 50 payload over a 27 byte ACL MTU
    host.l2cap().send(conn.id(), L2CAP_ATT_CID, vec![7; 50]).unwrap();
    host.process();

    let acl = host.driver_mut().take_acl();
    let lengths: Vec<usize> = acl.iter().map(|(_, data)| data.len()).collect();
    assert_eq!(lengths, vec![27, 27]);
    assert_eq!(acl[0].0.boundary, PacketBoundary::FirstNonFlushable);
    assert_eq!(acl[1].0.boundary, PacketBoundary::Continuation);
}

#[test]
fn test_send_failure_disconnects() {
    let mut host = host();
    let events = record_events(&mut host);
    let sent = att_channel(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);
    let id = conn.id();

    host.driver_mut().acl_failures = 1;
    host.l2cap().send(id, L2CAP_ATT_CID, vec![1; 10]).unwrap();
    host.process();

    assert!(host.driver().acl.is_empty());
    assert_eq!(host.credits.for_kind(ConnType::Le).available(), 4);
    assert_eq!(sent.lock().unwrap().len(), 1);
    assert!(sent.lock().unwrap()[0].is_err());
    {
        let c = conn.lock();
        assert_eq!(c.err, HCI_ERR_REMOTE_USER_TERM_CONN);
        assert_eq!(c.state, ConnState::Disconnecting);
    }
    assert_eq!(
        host.driver()
            .sent(|c| *c
                == HciCommand::Disconnect {
                    handle: 0x40,
                    reason: HCI_ERR_REMOTE_USER_TERM_CONN
                })
            .len(),
        1
    );

    deliver(&mut host, &[disconn_complete(0x40, HCI_ERR_REMOTE_USER_TERM_CONN)]);
    assert_eq!(conn.lock().state, ConnState::Disconnected);
    assert_eq!(
        events.lock().unwrap().last(),
        Some(&ConnEvent::Disconnected {
            conn: id,
            reason: HCI_ERR_REMOTE_USER_TERM_CONN
        })
    );
}

#[test]
fn test_link_loss_fails_unacknowledged_sdus() {
    let mut host = host();
    let sent = att_channel(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);

    host.l2cap().send(conn.id(), L2CAP_ATT_CID, vec![1; 10]).unwrap();
    host.l2cap().send(conn.id(), L2CAP_ATT_CID, vec![2; 10]).unwrap();
    host.process();
    assert_eq!(host.credits.for_kind(ConnType::Le).available(), 2);

    deliver(&mut host, &[disconn_complete(0x40, HCI_ERR_CONN_TIMEOUT)]);
    assert_eq!(host.credits.for_kind(ConnType::Le).available(), 4);
    let sent = sent.lock().unwrap();
    assert_eq!(sent.len(), 2);
    assert!(sent.iter().all(|r| r.is_err()));
    assert_eq!(conn.lock().err, HCI_ERR_CONN_TIMEOUT);
}

#[test]
fn test_fragmented_inbound_pdu_reassembled() {
    struct Inbox(Arc<Mutex<Vec<Vec<u8>>>>);
    impl ChannelOps for Inbox {
        fn recv(&mut self, _chan: ChanRef, sdu: &[u8]) -> L2capResult<()> {
            self.0.lock().unwrap().push(sdu.to_vec());
            Ok(())
        }
    }

    let mut host = host();
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    host.l2cap()
        .register_fixed_channel(
            L2CAP_ATT_CID,
            Box::new(move |_| Some(Box::new(Inbox(sink.clone())) as Box<dyn ChannelOps>)),
        )
        .unwrap();
    let _conn = accept_link(&mut host, 0x40, 1);

    let pdu = l2cap_pdu(L2CAP_ATT_CID, &[0x55; 40]);
    deliver(
        &mut host,
        &[
            acl(0x40, PacketBoundary::First, &pdu[..20]),
            acl(0x40, PacketBoundary::Continuation, &pdu[20..]),
        ],
    );
    assert_eq!(*inbox.lock().unwrap(), vec![vec![0x55; 40]]);

    // A continuation without a start is dropped.
    deliver(&mut host, &[acl(0x40, PacketBoundary::Continuation, &pdu[20..])]);
    assert_eq!(inbox.lock().unwrap().len(), 1);
}

#[test]
fn test_central_param_update_uses_link_layer() {
    let mut host = host();
    let conn = host
        .conn_le_create(peer(1), CreateParams::default(), ConnParams::default())
        .unwrap();
    deliver(&mut host, &[le_conn_complete(0x40, ROLE_CENTRAL, &peer(1))]);

    let current = ConnParams {
        interval_min: 0x0028,
        interval_max: 0x0028,
        latency: 0,
        timeout: 0x01F4,
    };
    assert!(matches!(
        host.conn_le_param_update(conn.id(), current),
        Err(Error::Already)
    ));

    let wanted = ConnParams {
        interval_min: 0x0010,
        interval_max: 0x0020,
        latency: 0,
        timeout: 0x01F4,
    };
    host.conn_le_param_update(conn.id(), wanted).unwrap();
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::LeConnectionUpdate { handle: 0x40, .. }))
            .len(),
        1
    );
}

#[test]
fn test_peripheral_param_update_falls_back_to_l2cap() {
    let mut host = host();
    let conn = accept_link(&mut host, 0x40, 1);
    host.driver_mut().take_acl();

    let wanted = ConnParams {
        interval_min: 0x0010,
        interval_max: 0x0020,
        latency: 0,
        timeout: 0x01F4,
    };
    host.conn_le_param_update(conn.id(), wanted).unwrap();
    host.process();

    assert!(host
        .driver()
        .sent(|c| matches!(c, HciCommand::LeConnectionUpdate { .. }))
        .is_empty());
    let acl = host.driver_mut().take_acl();
    assert_eq!(acl.len(), 1);
    // LE signalling channel
    assert_eq!(&acl[0].1[2..4], &[0x05, 0x00]);
    assert!(conn.lock().flags.contains(ConnFlags::PARAM_L2CAP));
}

#[test]
fn test_iso_needs_controller_buffers() {
    let mut host = host();
    assert!(matches!(host.iso_bind(0x60), Err(Error::NotSupported)));
}

#[test]
fn test_iso_stream_send_and_unbind() {
    let controller =
        MockController::with_features(LeFeatures::ENCRYPTION | LeFeatures::DATA_LENGTH | LeFeatures::CIS_CENTRAL);
    let mut host = host_with(controller, HostConfig::default());
    let stream = host.iso_bind(0x60).unwrap();
    let id = stream.id();
    assert_eq!(stream.lock().state, ConnState::Connected);

    assert!(matches!(
        host.iso_send(id, vec![0; 252]),
        Err(Error::InvalidParameter(_))
    ));
    host.iso_send(id, vec![0xAB; 40]).unwrap();
    host.iso_send(id, vec![0xCD; 3]).unwrap();
    host.process();
    let iso = &host.driver().iso;
    assert_eq!(iso.len(), 2);
    assert_eq!(
        iso[0].0,
        IsoHeader {
            handle: 0x60,
            boundary: IsoHeader::COMPLETE,
            timestamp: false,
            length: 44,
        }
    );
    assert_eq!(iso[0].0.to_bytes(), [0x60, 0x20, 44, 0]);
    // Sequence number 0, SDU length 40
    let mut expected = vec![0x00, 0x00, 40, 0x00];
    expected.extend_from_slice(&[0xAB; 40]);
    assert_eq!(iso[0].1, expected);
    assert_eq!(iso[1].1, vec![0x01, 0x00, 3, 0x00, 0xCD, 0xCD, 0xCD]);

    // The load header pushes a full SDU over one buffer.
    host.driver_mut().iso.clear();
    host.iso_send(id, vec![0xEE; 251]).unwrap();
    host.process();
    let iso = &host.driver().iso;
    let fragments: Vec<(u8, u16)> = iso.iter().map(|(h, _)| (h.boundary, h.length)).collect();
    assert_eq!(fragments, vec![(IsoHeader::FIRST, 251), (IsoHeader::LAST, 4)]);
    assert_eq!(&iso[0].1[..4], &[0x02, 0x00, 251, 0x00]);

    host.iso_unbind(id).unwrap();
    assert!(matches!(host.iso_send(id, vec![1]), Err(Error::NotConnected)));
    assert!(matches!(host.iso_unbind(id), Err(Error::NotConnected)));
}

#[test]
fn test_auto_connect_uses_filter_accept_list() {
    let mut host = host();
    host.filter_accept_clear().unwrap();
    host.filter_accept_add(peer(2)).unwrap();
    let conn = host
        .conn_le_create_auto(CreateParams::default(), ConnParams::default())
        .unwrap();
    assert_eq!(conn.lock().state, ConnState::InitiatingFilterList);
    assert!(matches!(
        host.conn_le_create(peer(3), CreateParams::default(), ConnParams::default()),
        Err(Error::Already)
    ));

    let create = host.driver().sent(|c| matches!(c, HciCommand::LeCreateConnection { .. }));
    let [HciCommand::LeCreateConnection {
        filter_policy,
        peer_addr,
        ..
    }] = create.as_slice()
    else {
        panic!("expected one create connection command");
    };
    assert_eq!(*filter_policy, FILTER_POLICY_FILTER_ACCEPT_LIST);
    assert_eq!(*peer_addr, BdAddr::ANY);
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::LeAddDeviceToFilterAcceptList { .. }))
            .len(),
        1
    );

    // Whichever listed device answers becomes the peer.
    deliver(&mut host, &[le_conn_complete(0x40, ROLE_CENTRAL, &peer(2))]);
    let c = conn.lock();
    assert_eq!(c.state, ConnState::Connected);
    assert_eq!(c.peer, peer(2));
}

fn param_request(handle: u16, interval_min: u16, interval_max: u16) -> Vec<u8> {
    let mut p = handle.to_le_bytes().to_vec();
    for value in [interval_min, interval_max, 0, 0x01F4] {
        p.extend_from_slice(&value.to_le_bytes());
    }
    le_event(EVT_LE_REMOTE_CONN_PARAM_REQ, &p)
}

#[test]
fn test_remote_param_request_filter() {
    let mut host = host();
    accept_link(&mut host, 0x40, 1);
    host.set_param_request_filter(Box::new(|_, params| params.interval_min >= 0x0010));

    deliver(&mut host, &[param_request(0x40, 0x0018, 0x0028)]);
    assert_eq!(
        host.driver().commands.last(),
        Some(&HciCommand::LeRemoteConnParamReqReply {
            handle: 0x40,
            interval_min: 0x0018,
            interval_max: 0x0028,
            latency: 0,
            timeout: 0x01F4,
        })
    );

    deliver(&mut host, &[param_request(0x40, 0x0008, 0x0028)]);
    assert_eq!(
        host.driver().commands.last(),
        Some(&HciCommand::LeRemoteConnParamReqNegReply {
            handle: 0x40,
            reason: HCI_ERR_INVALID_LL_PARAM,
        })
    );

    // Out of range parameters never reach the filter.
    deliver(&mut host, &[param_request(0x40, 0x0028, 0x0018)]);
    assert!(matches!(
        host.driver().commands.last(),
        Some(HciCommand::LeRemoteConnParamReqNegReply { .. })
    ));
}

#[test]
fn test_data_length_request() {
    let mut host = host();
    let conn = accept_link(&mut host, 0x40, 1);
    host.conn_set_data_len(conn.id(), 251, 2120).unwrap();
    assert_eq!(
        host.driver().commands.last(),
        Some(&HciCommand::LeSetDataLength {
            handle: 0x40,
            tx_octets: 251,
            tx_time: 2120,
        })
    );

    let mut host = host_with(
        MockController::with_features(LeFeatures::ENCRYPTION),
        HostConfig::default(),
    );
    let conn = accept_link(&mut host, 0x40, 1);
    assert!(matches!(
        host.conn_set_data_len(conn.id(), 251, 2120),
        Err(Error::NotSupported)
    ));
}

#[test]
fn test_security_level_change() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);
    let id = conn.id();
    assert!(matches!(
        host.conn_set_security(id, SecurityLevel::None),
        Err(Error::Already)
    ));

    host.conn_set_security(id, SecurityLevel::Encryption).unwrap();
    assert_eq!(conn.lock().security, SecurityLevel::Encryption);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        ConnEvent::SecurityChanged { conn, level: SecurityLevel::Encryption } if *conn == id
    )));
}

#[test]
fn test_disconnect_unknown_connection() {
    let mut host = host();
    let conn = accept_link(&mut host, 0x40, 1);
    let id = conn.id();
    deliver(&mut host, &[disconn_complete(0x40, HCI_ERR_CONN_TIMEOUT)]);
    drop(conn);
    host.process();

    assert!(matches!(
        host.disconnect(id, HCI_ERR_REMOTE_USER_TERM_CONN),
        Err(Error::NotConnected)
    ));
}

#[test]
fn test_encryption_change_raises_security() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);

    deliver(&mut host, &[event(EVT_ENCRYPTION_CHANGE, &[0x00, 0x40, 0x00, 0x01])]);
    assert_eq!(conn.lock().security, SecurityLevel::Encryption);
    assert!(conn.lock().encrypted);

    // A failed change leaves the link as it was.
    deliver(&mut host, &[event(EVT_ENCRYPTION_CHANGE, &[HCI_ERR_UNSPECIFIED, 0x40, 0x00, 0x00])]);
    assert!(conn.lock().encrypted);

    deliver(&mut host, &[event(EVT_ENCRYPTION_CHANGE, &[0x00, 0x40, 0x00, 0x00])]);
    assert_eq!(conn.lock().security, SecurityLevel::None);
    let changes = events
        .lock()
        .unwrap()
        .iter()
        .filter(|e| matches!(e, ConnEvent::SecurityChanged { .. }))
        .count();
    assert_eq!(changes, 2);
}

#[test]
fn test_host_flow_control_acks_inbound_acl() {
    let config = HostConfig {
        host_flow_control: Some(HostFlowControl {
            acl_mtu: 251,
            acl_pkts: 8,
        }),
        ..HostConfig::default()
    };
    let mut host = Host::new(MockController::default(), config).unwrap();
    host.init().unwrap();
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::SetControllerToHostFlowControl { enable: true }))
            .len(),
        1
    );

    accept_link(&mut host, 0x40, 1);
    host.driver_mut().unacked.clear();
    deliver(
        &mut host,
        &[acl(0x40, PacketBoundary::First, &l2cap_pdu(L2CAP_ATT_CID, &[0x01, 0x02]))],
    );
    assert_eq!(
        host.driver().unacked,
        vec![HciCommand::HostNumberOfCompletedPackets {
            completed: vec![(0x40, 1)],
        }]
    );
}

#[test]
fn test_shutdown_drops_links() {
    let mut host = host();
    let events = record_events(&mut host);
    let conn = accept_link(&mut host, 0x40, 1);
    let id = conn.id();
    drop(conn);

    host.shutdown().unwrap();
    assert!(host.conn_get(id).is_none());
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        ConnEvent::Disconnected { reason: HCI_ERR_LOCALHOST_TERM_CONN, .. }
    )));
    assert_eq!(host.driver().commands.last(), Some(&HciCommand::Reset));
    assert!(matches!(host.shutdown(), Err(Error::InvalidState)));
}

#[test]
fn test_data_queued_before_disconnection_delivered() {
    struct Inbox(Arc<Mutex<Vec<Vec<u8>>>>);
    impl ChannelOps for Inbox {
        fn recv(&mut self, _chan: ChanRef, sdu: &[u8]) -> L2capResult<()> {
            self.0.lock().unwrap().push(sdu.to_vec());
            Ok(())
        }
    }

    let mut host = host();
    let events = record_events(&mut host);
    let inbox = Arc::new(Mutex::new(Vec::new()));
    let sink = inbox.clone();
    host.l2cap()
        .register_fixed_channel(
            L2CAP_ATT_CID,
            Box::new(move |_| Some(Box::new(Inbox(sink.clone())) as Box<dyn ChannelOps>)),
        )
        .unwrap();
    let conn = accept_link(&mut host, 0x40, 1);

    let pdu = l2cap_pdu(L2CAP_ATT_CID, &[0x0A, 0x0B]);
    host.recv(&acl(0x40, PacketBoundary::First, &pdu)).unwrap();
    host.recv(&disconn_complete(0x40, HCI_ERR_CONN_TIMEOUT)).unwrap();
    assert_eq!(conn.lock().state, ConnState::Connected);

    host.process();
    assert_eq!(*inbox.lock().unwrap(), vec![vec![0x0A, 0x0B]]);
    assert_eq!(conn.lock().state, ConnState::Disconnected);
    assert!(events.lock().unwrap().iter().any(|e| matches!(
        e,
        ConnEvent::Disconnected { reason: HCI_ERR_CONN_TIMEOUT, .. }
    )));

    // Nothing queued for the link: torn down on arrival.
    let conn = accept_link(&mut host, 0x41, 2);
    host.recv(&disconn_complete(0x41, HCI_ERR_CONN_TIMEOUT)).unwrap();
    assert_eq!(conn.lock().state, ConnState::Disconnected);
}

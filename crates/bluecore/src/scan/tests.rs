use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::*;
use crate::config::HostConfig;
use crate::conn::{ConnParams, CreateParams};
use crate::testing::*;

fn ext_controller() -> MockController {
    MockController::with_features(
        LeFeatures::ENCRYPTION | LeFeatures::EXT_ADV | LeFeatures::PERIODIC_ADV,
    )
}

fn advertiser(last: u8) -> LeAddr {
    LeAddr::public([last, 0x10, 0x20, 0x30, 0x40, 0x50])
}

fn start_scan(host: &mut Host<MockController>, params: ScanParams) -> Arc<Mutex<Vec<ScanEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    host.scan_start(params, Box::new(move |e| sink.lock().unwrap().push(e.clone())))
        .unwrap();
    events
}

fn reports(events: &Arc<Mutex<Vec<ScanEvent>>>) -> Vec<ScanReport> {
    events
        .lock()
        .unwrap()
        .iter()
        .filter_map(|e| match e {
            ScanEvent::Report(report) => Some(report.clone()),
            ScanEvent::Timeout => None,
        })
        .collect()
}

fn record_syncs(host: &mut Host<MockController>) -> Arc<Mutex<Vec<SyncEvent>>> {
    let events = Arc::new(Mutex::new(Vec::new()));
    let sink = events.clone();
    host.register_sync_callback(Box::new(move |e| sink.lock().unwrap().push(e.clone())));
    events
}

fn sync_to(addr: LeAddr, sid: u8) -> SyncParams {
    SyncParams {
        addr: Some(addr),
        sid,
        ..SyncParams::default()
    }
}

#[test]
fn test_legacy_active_scan() {
    let mut host = host();
    let events = start_scan(&mut host, ScanParams::default());

    let commands = host.driver_mut().take_commands();
    assert!(matches!(commands[0], HciCommand::LeSetRandomAddress { addr } if addr.is_nrpa()));
    assert!(matches!(
        commands[1],
        HciCommand::LeSetScanParameters {
            scan_type: LE_SCAN_ACTIVE,
            own_address_type: OWN_ADDR_RANDOM,
            ..
        }
    ));
    assert_eq!(
        commands[2],
        HciCommand::LeSetScanEnable {
            enable: true,
            filter_duplicates: true
        }
    );
    assert_eq!(
        host.scan_flags(),
        ScanFlags::EXPLICIT | ScanFlags::SCANNING | ScanFlags::ACTIVE | ScanFlags::NRPA
    );

    deliver(&mut host, &[adv_report(ADV_IND, &advertiser(1), &[2, 1, 6], -40)]);
    assert_eq!(
        reports(&events),
        vec![ScanReport {
            addr: advertiser(1),
            rssi: -40,
            tx_power: TX_POWER_UNKNOWN,
            adv_props: EXT_ADV_EVT_CONNECTABLE | EXT_ADV_EVT_SCANNABLE | EXT_ADV_EVT_LEGACY,
            sid: SID_NONE,
            primary_phy: PHY_1M,
            secondary_phy: 0,
            periodic_interval: 0,
            data: vec![2, 1, 6],
            truncated: false,
        }]
    );

    host.scan_stop().unwrap();
    assert_eq!(
        host.driver().sent(|c| *c
            == HciCommand::LeSetScanEnable {
                enable: false,
                filter_duplicates: false
            })
            .len(),
        1
    );
    assert!(host.scan_flags().is_empty());
    assert!(matches!(host.scan_stop(), Err(Error::Already)));
}

#[test]
fn test_scan_start_checks() {
    let mut host = host();
    let bad = ScanParams {
        interval: 0x0010,
        window: 0x0020,
        ..ScanParams::default()
    };
    assert!(matches!(
        host.scan_start(bad, Box::new(|_| {})),
        Err(Error::InvalidParameter(_))
    ));
    let coded = ScanParams {
        coded: Some((0x0010, 0x0010)),
        ..ScanParams::default()
    };
    assert!(matches!(
        host.scan_start(coded, Box::new(|_| {})),
        Err(Error::NotSupported)
    ));
    assert!(host.driver().commands.is_empty());

    start_scan(&mut host, ScanParams::default());
    assert!(matches!(
        host.scan_start(ScanParams::default(), Box::new(|_| {})),
        Err(Error::Already)
    ));
}

#[test]
fn test_legacy_scan_duration_uses_host_timer() {
    let mut host = host();
    let params = ScanParams {
        scan_type: ScanType::Passive,
        timeout: 100,
        ..ScanParams::default()
    };
    let events = start_scan(&mut host, params);
    assert!(host.scan_flags().contains(ScanFlags::LIMITED));
    assert!(host.next_deadline().is_some());

    host.process_timeouts(Instant::now() + Duration::from_secs(2));
    assert_eq!(*events.lock().unwrap(), vec![ScanEvent::Timeout]);
    assert!(!host.scan_flags().contains(ScanFlags::EXPLICIT));
    assert!(!host.scan_flags().contains(ScanFlags::SCANNING));
}

#[test]
fn test_ext_scan_duration_from_controller() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let params = ScanParams {
        timeout: 100,
        ..ScanParams::default()
    };
    let events = start_scan(&mut host, params);
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::LeSetExtScanEnable { enable: true, duration: 100, .. }))
            .len(),
        1
    );
    assert!(host.next_deadline().is_none());

    deliver(&mut host, &[le_event(EVT_LE_SCAN_TIMEOUT, &[])]);
    assert_eq!(*events.lock().unwrap(), vec![ScanEvent::Timeout]);
    assert!(host.scan_flags().is_empty());

    // A stray timeout changes nothing.
    deliver(&mut host, &[le_event(EVT_LE_SCAN_TIMEOUT, &[])]);
    assert_eq!(events.lock().unwrap().len(), 1);
}

#[test]
fn test_ext_report_reassembly() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = start_scan(&mut host, ScanParams::default());
    let a = advertiser(1);

    deliver(&mut host, &[ext_adv_report(ext_evt(0, 1), &a, 1, b"hello ")]);
    assert!(reports(&events).is_empty());
    deliver(&mut host, &[ext_adv_report(ext_evt(0, 0), &a, 1, b"world")]);

    let got = reports(&events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, b"hello world");
    assert!(!got[0].truncated);
    assert_eq!(got[0].sid, 1);
    assert_eq!(got[0].adv_props, 0);
    assert_eq!(got[0].secondary_phy, PHY_2M);
}

#[test]
fn test_second_advertiser_dropped_during_reassembly() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = start_scan(&mut host, ScanParams::default());
    let (a, b) = (advertiser(1), advertiser(2));

    deliver(
        &mut host,
        &[
            ext_adv_report(ext_evt(0, 1), &a, 1, b"abc"),
            ext_adv_report(ext_evt(0, 0), &b, 1, b"other"),
            // Same address, different set
            ext_adv_report(ext_evt(0, 0), &a, 2, b"set two"),
            ext_adv_report(ext_evt(0, 0), &a, 1, b"def"),
            ext_adv_report(ext_evt(0, 0), &b, 1, b"later"),
        ],
    );

    let got: Vec<(LeAddr, Vec<u8>)> = reports(&events)
        .into_iter()
        .map(|r| (r.addr, r.data))
        .collect();
    assert_eq!(got, vec![(a, b"abcdef".to_vec()), (b, b"later".to_vec())]);
}

#[test]
fn test_legacy_pdu_in_ext_report_not_reassembled() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = start_scan(&mut host, ScanParams::default());
    let a = advertiser(1);

    deliver(
        &mut host,
        &[
            ext_adv_report(ext_evt(0, 1), &a, 1, b"abc"),
            ext_adv_report(EXT_ADV_EVT_LEGACY | EXT_ADV_EVT_CONNECTABLE, &advertiser(3), 0, b"legacy"),
        ],
    );
    let got = reports(&events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, b"legacy");
    assert!(got[0].is_connectable());
}

#[test]
fn test_truncated_report() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = start_scan(&mut host, ScanParams::default());
    let a = advertiser(1);

    deliver(
        &mut host,
        &[
            ext_adv_report(ext_evt(0, 1), &a, 1, b"abc"),
            ext_adv_report(ext_evt(0, 2), &a, 1, b"de"),
        ],
    );
    let got = reports(&events);
    assert_eq!(got.len(), 1);
    assert_eq!(got[0].data, b"abcde");
    assert!(got[0].truncated);
}

#[test]
fn test_report_larger_than_buffer() {
    let config = HostConfig {
        ext_scan_buf_len: 8,
        ..HostConfig::default()
    };
    let mut host = host_with(ext_controller(), config);
    let events = start_scan(&mut host, ScanParams::default());
    let a = advertiser(1);

    deliver(
        &mut host,
        &[
            ext_adv_report(ext_evt(0, 1), &a, 1, b"123456"),
            ext_adv_report(ext_evt(0, 1), &a, 1, b"789012"),
            // Rest of the oversized report
            ext_adv_report(ext_evt(0, 0), &a, 1, b"345"),
            ext_adv_report(ext_evt(0, 0), &a, 1, b"next"),
        ],
    );
    let got = reports(&events);
    assert_eq!(got.len(), 2);
    assert_eq!(got[0].data, b"12345678");
    assert!(got[0].truncated);
    assert_eq!(got[1].data, b"next");
    assert!(!got[1].truncated);
}

#[test]
fn test_scan_before_initiating() {
    let mut host = host();
    let peer = advertiser(1);
    let create = CreateParams {
        scan_before_initiating: true,
        ..CreateParams::default()
    };
    let conn = host
        .conn_le_create(peer, create, ConnParams::default())
        .unwrap();
    assert_eq!(conn.lock().state, ConnState::ScanBeforeInitiating);
    assert_eq!(host.scan_flags(), ScanFlags::INITIATOR | ScanFlags::SCANNING);
    assert!(matches!(
        host.driver().commands[0],
        HciCommand::LeSetScanParameters {
            scan_type: LE_SCAN_PASSIVE,
            scan_interval: 0x0060,
            scan_window: 0x0030,
            own_address_type: OWN_ADDR_PUBLIC,
            ..
        }
    ));

    // Someone else, or the peer not connectable
    deliver(
        &mut host,
        &[
            adv_report(ADV_IND, &advertiser(2), &[], -50),
            adv_report(ADV_NONCONN_IND, &peer, &[], -50),
        ],
    );
    assert_eq!(conn.lock().state, ConnState::ScanBeforeInitiating);

    deliver(&mut host, &[adv_report(ADV_IND, &peer, &[], -50)]);
    assert_eq!(conn.lock().state, ConnState::Initiating);
    assert!(host.scan_flags().is_empty());
    assert_eq!(
        host.driver()
            .sent(|c| matches!(c, HciCommand::LeCreateConnection { peer_addr, .. } if *peer_addr == peer.addr))
            .len(),
        1
    );
}

#[test]
fn test_explicit_scan_holds_back_initiation() {
    let mut host = host();
    let peer = advertiser(1);
    let create = CreateParams {
        scan_before_initiating: true,
        ..CreateParams::default()
    };
    let conn = host
        .conn_le_create(peer, create, ConnParams::default())
        .unwrap();

    // Implicit scans never report.
    deliver(&mut host, &[adv_report(ADV_NONCONN_IND, &advertiser(2), &[], -50)]);

    let events = start_scan(&mut host, ScanParams::default());
    deliver(&mut host, &[adv_report(ADV_IND, &peer, &[], -50)]);
    assert_eq!(conn.lock().state, ConnState::ScanBeforeInitiating);
    assert_eq!(reports(&events).len(), 1);

    host.scan_stop().unwrap();
    assert_eq!(host.scan_flags(), ScanFlags::INITIATOR | ScanFlags::SCANNING);

    // Cancelling the connection stops the implicit scan.
    host.disconnect(conn.id(), HCI_ERR_LOCALHOST_TERM_CONN).unwrap();
    assert!(host.scan_flags().is_empty());
}

#[test]
fn test_periodic_sync_lifecycle() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = record_syncs(&mut host);
    let a = advertiser(1);

    let id = host.periodic_sync_create(sync_to(a, 2)).unwrap();
    assert!(matches!(
        host.driver().commands[0],
        HciCommand::LePeriodicAdvCreateSync { options: 0, sid: 2, addr, .. } if addr == a.addr
    ));
    assert_eq!(host.periodic_sync(id).unwrap().state(), SyncState::Syncing);
    assert_eq!(host.scan_flags(), ScanFlags::SYNC | ScanFlags::SCANNING);

    deliver(&mut host, &[sync_established(HCI_SUCCESS, 0x0101, 2, &a)]);
    let sync = host.periodic_sync(id).unwrap();
    assert_eq!(sync.state(), SyncState::Synced);
    assert_eq!(sync.handle(), Some(0x0101));
    assert_eq!(sync.interval(), 0x0050);
    assert!(host.scan_flags().is_empty());

    deliver(
        &mut host,
        &[
            periodic_report(0x0101, 1, b"ab"),
            periodic_report(0x0101, 0, b"cd"),
            // Unknown train
            periodic_report(0x0202, 0, b"zz"),
        ],
    );
    deliver(&mut host, &[le_event(EVT_LE_PER_ADV_SYNC_LOST, &0x0101u16.to_le_bytes())]);
    assert!(host.periodic_sync(id).is_none());

    assert_eq!(
        *events.lock().unwrap(),
        vec![
            SyncEvent::Synced {
                sync: id,
                addr: a,
                sid: 2,
                interval: 0x0050,
                phy: PHY_1M,
                conn: None,
                service_data: 0,
            },
            SyncEvent::Report {
                sync: id,
                tx_power: TX_POWER_UNKNOWN,
                rssi: -50,
                data: b"abcd".to_vec(),
                truncated: false,
            },
            SyncEvent::Terminated {
                sync: id,
                reason: HCI_ERR_CONN_TIMEOUT,
            },
        ]
    );
}

#[test]
fn test_periodic_sync_create_checks() {
    let mut host = host();
    assert!(matches!(
        host.periodic_sync_create(SyncParams::default()),
        Err(Error::NotSupported)
    ));

    let mut host = host_with(ext_controller(), HostConfig::default());
    assert!(matches!(
        host.periodic_sync_create(sync_to(advertiser(1), 0x10)),
        Err(Error::InvalidParameter(_))
    ));
    let short = SyncParams {
        timeout: 5,
        ..SyncParams::default()
    };
    assert!(host.periodic_sync_create(short).is_err());

    let first = host.periodic_sync_create(SyncParams::default()).unwrap();
    assert!(matches!(
        host.periodic_sync_create(sync_to(advertiser(2), 1)),
        Err(Error::Busy)
    ));

    // One slot, now taken by an established sync
    deliver(&mut host, &[sync_established(HCI_SUCCESS, 0x0101, 0, &advertiser(1))]);
    assert!(host.periodic_sync(first).is_some());
    assert!(matches!(
        host.periodic_sync_create(sync_to(advertiser(2), 1)),
        Err(Error::ResourceExhausted(_))
    ));

    host.periodic_sync_delete(first).unwrap();
    assert_eq!(
        host.driver()
            .sent(|c| *c == HciCommand::LePeriodicAdvTerminateSync { handle: 0x0101 })
            .len(),
        1
    );
    assert!(host.periodic_sync(first).is_none());
}

#[test]
fn test_cancelled_sync_is_silent() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = record_syncs(&mut host);
    let a = advertiser(1);

    let id = host.periodic_sync_create(sync_to(a, 1)).unwrap();
    host.periodic_sync_delete(id).unwrap();
    host.periodic_sync_delete(id).unwrap();
    assert_eq!(
        host.driver()
            .sent(|c| *c == HciCommand::LePeriodicAdvCreateSyncCancel)
            .len(),
        1
    );

    deliver(
        &mut host,
        &[sync_established(HCI_ERR_OP_CANCELLED_BY_HOST, 0, 1, &a)],
    );
    assert!(host.periodic_sync(id).is_none());
    assert!(events.lock().unwrap().is_empty());
    assert!(host.scan_flags().is_empty());

    // The cancel lost the race: the new sync is torn down at once.
    let id = host.periodic_sync_create(sync_to(a, 1)).unwrap();
    host.periodic_sync_delete(id).unwrap();
    deliver(&mut host, &[sync_established(HCI_SUCCESS, 0x0033, 1, &a)]);
    assert!(events.lock().unwrap().is_empty());
    assert_eq!(
        host.driver()
            .sent(|c| *c == HciCommand::LePeriodicAdvTerminateSync { handle: 0x0033 })
            .len(),
        1
    );
}

#[test]
fn test_failed_sync_reported() {
    let mut host = host_with(ext_controller(), HostConfig::default());
    let events = record_syncs(&mut host);
    let id = host.periodic_sync_create(sync_to(advertiser(1), 1)).unwrap();

    deliver(&mut host, &[sync_established(HCI_ERR_CONN_TIMEOUT, 0, 1, &advertiser(1))]);
    assert_eq!(
        *events.lock().unwrap(),
        vec![SyncEvent::Terminated {
            sync: id,
            reason: HCI_ERR_CONN_TIMEOUT
        }]
    );
    // The slot is free for the next attempt.
    host.periodic_sync_create(sync_to(advertiser(1), 1)).unwrap();
}

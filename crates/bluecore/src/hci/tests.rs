//! Unit tests for HCI packet encoding and event decoding

use super::acl::*;
use super::constants::*;
use super::driver::CommandComplete;
use super::event::*;
use super::packet::*;
use crate::error::HciError;
use crate::gap::{AddressType, BdAddr, LeAddr};

fn event_packet(code: u8, params: &[u8]) -> Vec<u8> {
    let mut data = vec![code, params.len() as u8];
    data.extend_from_slice(params);
    data
}

fn le_meta(subevent: u8, params: &[u8]) -> Vec<u8> {
    let mut body = vec![subevent];
    body.extend_from_slice(params);
    event_packet(EVT_LE_META_EVENT, &body)
}

#[test]
fn test_hci_command_serialization() {
    let packet = HciCommand::Reset.to_packet();
    assert_eq!(packet[0], HCI_COMMAND_PKT);
    // OGF_HOST_CTL << 10 | OCF_RESET
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0C03);
    assert_eq!(packet[3], 0);

    let command = HciCommand::LeSetScanParameters {
        scan_type: LE_SCAN_ACTIVE,
        scan_interval: 0x0010,
        scan_window: 0x0010,
        own_address_type: OWN_ADDR_PUBLIC,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x200B);
    assert_eq!(packet[3], 7);
    assert_eq!(&packet[4..], &[0x01, 0x10, 0x00, 0x10, 0x00, 0x00, 0x00]);

    let command = HciCommand::Disconnect {
        handle: 0x0040,
        reason: HCI_ERR_REMOTE_USER_TERM_CONN,
    };
    let packet = command.to_packet();
    assert_eq!(u16::from_le_bytes([packet[1], packet[2]]), 0x0406);
    assert_eq!(&packet[3..], &[3, 0x40, 0x00, 0x13]);

    let command = HciCommand::new(OGF_LE, OCF_LE_CREATE_CONN, vec![0x01, 0x02, 0x03]);
    assert_eq!(command.opcode(), 0x200D);
    assert_eq!(&command.to_packet()[3..], &[3, 0x01, 0x02, 0x03]);
}

#[test]
fn test_legacy_adv_data_is_padded() {
    let params = HciCommand::LeSetAdvertisingData {
        data: vec![0x02, 0x01, 0x06],
    }
    .parameters();
    assert_eq!(params.len(), 1 + LEGACY_ADV_DATA_MAX);
    assert_eq!(&params[..4], &[3, 0x02, 0x01, 0x06]);
    assert!(params[4..].iter().all(|b| *b == 0));
}

#[test]
fn test_ext_scan_parameters_per_phy() {
    let command = HciCommand::LeSetExtScanParameters {
        own_addr_type: OWN_ADDR_RANDOM,
        filter_policy: FILTER_POLICY_ACCEPT_ALL,
        phys: vec![
            ExtScanPhy {
                phy: PHY_1M,
                scan_type: LE_SCAN_PASSIVE,
                interval: 0x0060,
                window: 0x0030,
            },
            ExtScanPhy {
                phy: PHY_CODED,
                scan_type: LE_SCAN_PASSIVE,
                interval: 0x0120,
                window: 0x0090,
            },
        ],
    };
    assert_eq!(
        command.parameters(),
        vec![0x01, 0x00, 0x05, 0x00, 0x60, 0x00, 0x30, 0x00, 0x00, 0x20, 0x01, 0x90, 0x00]
    );
}

#[test]
fn test_ext_adv_enable_lists_sets() {
    let command = HciCommand::LeSetExtAdvEnable {
        enable: true,
        sets: vec![ExtAdvEnableSet {
            handle: 1,
            duration: 0x01F4,
            max_events: 0,
        }],
    };
    assert_eq!(command.parameters(), vec![0x01, 0x01, 0x01, 0xF4, 0x01, 0x00]);
}

#[test]
fn test_acl_header() {
    let header = AclHeader::new(0x0ABC, PacketBoundary::Continuation, 27);
    let bytes = header.to_bytes();
    assert_eq!(bytes, [0xBC, 0x1A, 27, 0]);
    assert_eq!(AclHeader::parse(&bytes).unwrap(), header);

    // Broadcast flags are kept apart from the handle
    let parsed = AclHeader::parse(&[0x40, 0xE0, 0x04, 0x00]).unwrap();
    assert_eq!(parsed.handle, 0x0040);
    assert_eq!(parsed.boundary, PacketBoundary::First);
    assert_eq!(parsed.broadcast, 3);
    assert_eq!(parsed.length, 4);

    assert!(AclHeader::parse(&[0x40, 0x00]).is_err());
    assert!(!PacketBoundary::Continuation.is_start());
    assert!(PacketBoundary::FirstNonFlushable.is_start());
}

#[test]
fn test_iso_headers() {
    let header = IsoHeader {
        handle: 0x0061,
        boundary: IsoHeader::boundary_for(true, false),
        timestamp: true,
        length: 0x0104,
    };
    assert_eq!(header.boundary, IsoHeader::FIRST);
    assert_eq!(header.to_bytes(), [0x61, 0x40, 0x04, 0x01]);
    assert_eq!(IsoHeader::boundary_for(false, false), IsoHeader::CONTINUATION);
    assert_eq!(IsoHeader::boundary_for(false, true), IsoHeader::LAST);

    let load = IsoDataLoad {
        timestamp: Some(0x0A0B0C0D),
        sequence: 0x1234,
        sdu_length: 300,
    };
    assert_eq!(
        load.to_bytes(),
        vec![0x0D, 0x0C, 0x0B, 0x0A, 0x34, 0x12, 0x2C, 0x01]
    );
}

#[test]
fn test_decode_command_events() {
    let event = Event::decode(&event_packet(EVT_CMD_COMPLETE, &[1, 0x03, 0x0C, 0x00])).unwrap();
    assert_eq!(
        event,
        Event::CommandComplete {
            num_packets: 1,
            opcode: 0x0C03,
            return_params: vec![0x00],
        }
    );
    assert!(event.is_priority());
    assert_eq!(
        CommandComplete::from_event(0x0C03, &event),
        Some(CommandComplete::success(0x0C03, Vec::new()))
    );
    assert_eq!(CommandComplete::from_event(0x200B, &event), None);

    let event = Event::decode(&event_packet(EVT_CMD_STATUS, &[0x0C, 1, 0x0D, 0x20])).unwrap();
    assert_eq!(
        CommandComplete::from_event(0x200D, &event),
        Some(CommandComplete {
            opcode: 0x200D,
            status: 0x0C,
            params: Vec::new(),
        })
    );
}

#[test]
fn test_decode_link_events() {
    let event = Event::decode(&event_packet(EVT_DISCONN_COMPLETE, &[0x00, 0x40, 0x00, 0x13])).unwrap();
    assert_eq!(
        event,
        Event::DisconnectionComplete {
            status: 0,
            handle: 0x0040,
            reason: 0x13,
        }
    );
    assert!(event.is_priority());

    let params = [2, 0x40, 0x00, 0x02, 0x00, 0x41, 0x00, 0x01, 0x00];
    let event = Event::decode(&event_packet(EVT_NUM_COMPLETED_PACKETS, &params)).unwrap();
    assert_eq!(
        event,
        Event::NumberOfCompletedPackets(vec![(0x0040, 2), (0x0041, 1)])
    );
    assert!(event.is_priority());

    let event = Event::decode(&event_packet(EVT_HARDWARE_ERROR, &[0x05])).unwrap();
    assert_eq!(event, Event::HardwareError { code: 5 });
    assert!(!event.is_priority());
}

#[test]
fn test_decode_le_connection_complete() {
    let mut params = vec![0x00, 0x40, 0x00, ROLE_PERIPHERAL, 0x01];
    params.extend_from_slice(&[1, 2, 3, 4, 5, 0xC6]);
    params.extend_from_slice(&[0x28, 0x00, 0x00, 0x00, 0xF4, 0x01, 0x00]);
    let Event::Le(LeEvent::ConnectionComplete(complete)) =
        Event::decode(&le_meta(EVT_LE_CONN_COMPLETE, &params)).unwrap()
    else {
        panic!("not a connection complete");
    };
    assert_eq!(complete.handle, 0x0040);
    assert_eq!(complete.peer, LeAddr::random([1, 2, 3, 4, 5, 0xC6]));
    assert_eq!(complete.interval, 0x0028);
    assert_eq!(complete.timeout, 0x01F4);
    assert_eq!(complete.local_rpa, None);
    assert_eq!(complete.adv_handle, None);
}

#[test]
fn test_decode_enhanced_connection_complete_v2() {
    let mut params = vec![0x00, 0x41, 0x00, ROLE_PERIPHERAL, 0x00];
    params.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
    // Local RPA, no peer RPA
    params.extend_from_slice(&[9, 9, 9, 9, 9, 0x49]);
    params.extend_from_slice(&[0; 6]);
    params.extend_from_slice(&[0x18, 0x00, 0x00, 0x00, 0x48, 0x00, 0x00]);
    params.extend_from_slice(&[0x02, 0xFF, 0xFF]);
    let Event::Le(LeEvent::ConnectionComplete(complete)) =
        Event::decode(&le_meta(EVT_LE_ENH_CONN_COMPLETE_V2, &params)).unwrap()
    else {
        panic!("not a connection complete");
    };
    assert_eq!(complete.peer.kind, AddressType::Public);
    assert_eq!(complete.local_rpa, Some(BdAddr::new([9, 9, 9, 9, 9, 0x49])));
    assert_eq!(complete.peer_rpa, None);
    assert_eq!(complete.adv_handle, Some(2));
}

#[test]
fn test_decode_ext_adv_report() {
    let event_type = EXT_ADV_EVT_CONNECTABLE | (1 << EXT_ADV_EVT_DATA_STATUS_SHIFT);
    let mut params = vec![1];
    params.extend_from_slice(&event_type.to_le_bytes());
    params.push(0x00);
    params.extend_from_slice(&[1, 2, 3, 4, 5, 6]);
    params.extend_from_slice(&[PHY_1M, PHY_2M, 3, 0x7F, 0xC4, 0x00, 0x00, 0x00]);
    params.extend_from_slice(&[0; 6]);
    params.extend_from_slice(&[2, 0xAA, 0xBB]);

    let Event::Le(LeEvent::ExtAdvertisingReport(reports)) =
        Event::decode(&le_meta(EVT_LE_EXT_ADVERTISING_REPORT, &params)).unwrap()
    else {
        panic!("not an extended report");
    };
    let report = &reports[0];
    assert_eq!(report.data_status(), DataStatus::Incomplete);
    assert!(report.is_connectable());
    assert!(!report.is_legacy());
    assert_eq!(report.sid, 3);
    assert_eq!(report.rssi, -60);
    assert_eq!(report.data, vec![0xAA, 0xBB]);
}

#[test]
fn test_data_status_values() {
    assert_eq!(DataStatus::from(0), DataStatus::Complete);
    assert_eq!(DataStatus::from(1), DataStatus::Incomplete);
    assert_eq!(DataStatus::from(2), DataStatus::Truncated);
    assert_eq!(DataStatus::from(3), DataStatus::Truncated);
}

#[test]
fn test_short_events_rejected() {
    assert!(matches!(
        Event::decode(&[EVT_DISCONN_COMPLETE]),
        Err(HciError::InvalidPacketFormat)
    ));
    // Declared length longer than the packet
    assert!(matches!(
        Event::decode(&[EVT_DISCONN_COMPLETE, 4, 0x00, 0x40]),
        Err(HciError::InvalidParamLength(4))
    ));
    // Parameters shorter than the event needs
    assert!(matches!(
        Event::decode(&event_packet(EVT_DISCONN_COMPLETE, &[0x00, 0x40])),
        Err(HciError::InvalidPacketFormat)
    ));
    // Report data running past the end
    assert!(Event::decode(&le_meta(EVT_LE_ADVERTISING_REPORT, &[1, 0, 0, 1, 2, 3, 4, 5, 6, 10])).is_err());
}

#[test]
fn test_unknown_events_kept() {
    let event = Event::decode(&event_packet(0xFE, &[1, 2])).unwrap();
    assert_eq!(
        event,
        Event::Unknown {
            code: 0xFE,
            params: vec![1, 2],
        }
    );
    let event = Event::decode(&le_meta(0x3F, &[7])).unwrap();
    assert_eq!(
        event,
        Event::Le(LeEvent::Unknown {
            subevent: 0x3F,
            params: vec![7],
        })
    );
}

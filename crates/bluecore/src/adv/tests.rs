#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use super::super::data::{encode, fit_legacy, AdStream};
    use super::super::*;
    use crate::config::HostConfig;
    use crate::conn::ConnEvent;
    use crate::gap::constants::*;
    use crate::testing::*;

    fn ext_controller() -> MockController {
        MockController::with_features(LeFeatures::ENCRYPTION | LeFeatures::EXT_ADV | LeFeatures::PHY_2M)
    }

    fn record(host: &mut Host<MockController>) -> Arc<Mutex<Vec<AdvEvent>>> {
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        host.register_adv_callback(Box::new(move |event| sink.lock().unwrap().push(event.clone())));
        events
    }

    fn connectable() -> AdvParams {
        AdvParams {
            options: AdvOptions::CONNECTABLE | AdvOptions::SCANNABLE,
            ..AdvParams::default()
        }
    }

    fn flags() -> AdData {
        AdData::new(ADV_TYPE_FLAGS, [0x06])
    }

    fn peer() -> LeAddr {
        LeAddr::public([0x01, 0x02, 0x03, 0x04, 0x05, 0x06])
    }

    fn ext_data_ops(host: &Host<MockController>) -> Vec<(u8, usize)> {
        host.driver()
            .commands
            .iter()
            .filter_map(|c| match c {
                HciCommand::LeSetExtAdvData { operation, data, .. } => Some((*operation, data.len())),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_long_name_is_shortened() {
        let manufacturer = AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, [0x59, 0x00, 1, 2, 3]);
        let name = AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, "a rather long device name here");
        let ad = vec![flags(), manufacturer.clone(), name];

        let bytes = fit_legacy(&ad, LEGACY_ADV_DATA_MAX).unwrap();
        assert_eq!(bytes.len(), LEGACY_ADV_DATA_MAX);
        // Flags and manufacturer data come through untouched.
        assert_eq!(&bytes[..3], &[0x02, ADV_TYPE_FLAGS, 0x06]);
        assert_eq!(&bytes[3..10], encode(&[manufacturer]).as_slice());
        assert_eq!(bytes[10], 20);
        assert_eq!(bytes[11], ADV_TYPE_SHORT_LOCAL_NAME);
        assert_eq!(&bytes[12..], b"a rather long devic");
    }

    #[test]
    fn test_oversized_data_without_name_rejected() {
        let ad = vec![AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, [0u8; 40])];
        assert!(matches!(
            fit_legacy(&ad, LEGACY_ADV_DATA_MAX),
            Err(Error::InvalidParameter(_))
        ));

        // The name alone cannot absorb the excess.
        let ad = vec![
            AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, [0u8; 27]),
            AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, "abc"),
        ];
        assert!(fit_legacy(&ad, LEGACY_ADV_DATA_MAX).is_err());
    }

    #[test]
    fn test_ad_stream_spans_groups() {
        let ad = vec![flags(), AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, [7u8; 12])];
        let sd = vec![AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, "stream")];
        let groups: [&[AdData]; 2] = [&ad, &sd];
        let mut stream = AdStream::new(&groups);
        assert_eq!(stream.remaining(), 3 + 14 + 8);

        let mut chunks = Vec::new();
        while !stream.is_done() {
            chunks.push(stream.next_chunk(4));
        }
        assert!(chunks.iter().all(|c| c.len() <= 4));
        assert_eq!(chunks.len(), 7);
        let mut expected = encode(&ad);
        expected.extend(encode(&sd));
        assert_eq!(chunks.concat(), expected);
    }

    #[test]
    fn test_legacy_advertising_commands() {
        let mut host = host();
        let ad = [flags()];
        let sd = [AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, "dev")];
        let handle = host.adv_start(connectable(), &ad, &sd).unwrap();

        let commands = host.driver_mut().take_commands();
        assert!(matches!(
            commands[0],
            HciCommand::LeSetAdvertisingParameters {
                adv_type: ADV_TYPE_IND,
                own_addr_type: OWN_ADDR_PUBLIC,
                ..
            }
        ));
        assert_eq!(commands[1], HciCommand::LeSetAdvertisingData { data: encode(&ad) });
        assert_eq!(commands[2], HciCommand::LeSetScanResponseData { data: encode(&sd) });
        assert_eq!(commands[3], HciCommand::LeSetAdvertisingEnable { enable: true });
        assert_eq!(commands.len(), 4);

        let set = host.adv_set(handle).unwrap();
        assert_eq!(set.state(), AdvState::Enabled);
        assert!(set.flags().contains(AdvFlags::PERSIST));
        assert!(host.conns().find(|c| c.state == ConnState::AdvConnectable).is_some());

        host.adv_stop().unwrap();
        assert!(host.adv_set(handle).is_none());
        assert_eq!(
            host.driver().sent(|c| *c == HciCommand::LeSetAdvertisingEnable { enable: false }).len(),
            1
        );
        host.process();
        assert_eq!(host.conns().in_use(), 0);
    }

    #[test]
    fn test_device_name_goes_to_scan_response() {
        let mut host = host();
        let params = AdvParams {
            options: AdvOptions::CONNECTABLE | AdvOptions::SCANNABLE | AdvOptions::USE_NAME,
            ..AdvParams::default()
        };
        host.adv_start(params, &[flags()], &[]).unwrap();

        let name = AdData::new(ADV_TYPE_COMPLETE_LOCAL_NAME, "bluecore");
        assert_eq!(
            host.driver().sent(|c| *c == HciCommand::LeSetScanResponseData { data: encode(&[name.clone()]) }).len(),
            1
        );
    }

    #[test]
    fn test_parameter_validation() {
        let mut host = host();

        let not_scannable = AdvParams {
            options: AdvOptions::CONNECTABLE,
            ..AdvParams::default()
        };
        assert!(matches!(host.adv_create(not_scannable), Err(Error::InvalidParameter(_))));

        let directed_unconnectable = AdvParams {
            peer: Some(peer()),
            ..AdvParams::default()
        };
        assert!(host.adv_create(directed_unconnectable).is_err());

        let bad_interval = AdvParams {
            interval_min: 0x0100,
            interval_max: 0x0080,
            ..AdvParams::default()
        };
        assert!(host.adv_create(bad_interval).is_err());

        let ext = AdvParams {
            options: AdvOptions::EXT_ADV,
            ..AdvParams::default()
        };
        assert!(matches!(host.adv_create(ext), Err(Error::NotSupported)));

        let unknown_id = AdvParams {
            id: 3,
            ..AdvParams::default()
        };
        assert!(host.adv_create(unknown_id).is_err());
        assert!(host.driver().commands.is_empty());
    }

    #[test]
    fn test_extended_only_combinations() {
        let mut host = host_with(ext_controller(), HostConfig::default());

        let high_duty = AdvParams {
            options: AdvOptions::EXT_ADV | AdvOptions::CONNECTABLE,
            peer: Some(peer()),
            ..AdvParams::default()
        };
        assert!(matches!(host.adv_create(high_duty), Err(Error::InvalidParameter(_))));

        let both = AdvParams {
            options: AdvOptions::EXT_ADV | AdvOptions::CONNECTABLE | AdvOptions::SCANNABLE,
            ..AdvParams::default()
        };
        assert!(host.adv_create(both).is_err());

        let low_duty = AdvParams {
            options: AdvOptions::EXT_ADV | AdvOptions::CONNECTABLE | AdvOptions::DIR_LOW_DUTY,
            peer: Some(peer()),
            ..AdvParams::default()
        };
        let handle = host.adv_create(low_duty).unwrap();
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::ParamsSet);
        assert!(matches!(
            host.driver().commands[0],
            HciCommand::LeSetExtAdvParameters {
                properties,
                secondary_phy: PHY_2M,
                ..
            } if properties == EXT_ADV_PROP_CONNECTABLE | EXT_ADV_PROP_DIRECTED
        ));
    }

    #[test]
    fn test_legacy_controller_has_one_set() {
        let mut host = host();
        let params = AdvParams::default();
        host.adv_create(params.clone()).unwrap();
        assert!(matches!(
            host.adv_create(params),
            Err(Error::ResourceExhausted(_))
        ));
    }

    #[test]
    fn test_same_data_twice_gives_same_commands() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV,
                ..AdvParams::default()
            })
            .unwrap();
        let ad = [flags(), AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, [9u8; 100])];

        host.adv_set_data(handle, &ad, &[]).unwrap();
        let first = host.driver_mut().take_commands();
        host.adv_set_data(handle, &ad, &[]).unwrap();
        let second = host.driver_mut().take_commands();

        assert_eq!(first, second);
        assert_eq!(
            first,
            vec![HciCommand::LeSetExtAdvData {
                handle: handle.index,
                operation: ADV_DATA_OP_COMPLETE,
                frag_pref: ADV_DATA_FRAG_NOT_PREFERRED,
                data: encode(&ad),
            }]
        );
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::DataSet);
    }

    #[test]
    fn test_large_ext_data_is_fragmented() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV,
                ..AdvParams::default()
            })
            .unwrap();
        let ad: Vec<AdData> = (0..3u8)
            .map(|i| AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, vec![i; 200]))
            .collect();

        host.adv_set_data(handle, &ad, &[]).unwrap();
        assert_eq!(
            ext_data_ops(&host),
            vec![
                (ADV_DATA_OP_FIRST, 251),
                (ADV_DATA_OP_INTERMEDIATE, 251),
                (ADV_DATA_OP_LAST, 104),
            ]
        );

        // Too much for the controller
        let huge: Vec<AdData> = (0..8u8)
            .map(|i| AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, vec![i; 250]))
            .collect();
        assert!(matches!(
            host.adv_set_data(handle, &huge, &[]),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_oversized_ad_structure_refused() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV,
                ..AdvParams::default()
            })
            .unwrap();

        let item = AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, vec![0xAA; 300]);
        assert!(matches!(
            host.adv_set_data(handle, &[item], &[]),
            Err(Error::InvalidParameter(_))
        ));
        assert!(ext_data_ops(&host).is_empty());

        // 254 data octets still fit the length octet.
        let item = AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, vec![0xAA; 254]);
        host.adv_set_data(handle, &[item], &[]).unwrap();
        let first = host
            .driver()
            .commands
            .iter()
            .find_map(|c| match c {
                HciCommand::LeSetExtAdvData { data, .. } => Some(data[0]),
                _ => None,
            });
        assert_eq!(first, Some(255));
    }

    #[test]
    fn test_fragmented_update_while_enabled_refused() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV,
                ..AdvParams::default()
            })
            .unwrap();
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams::default()).unwrap();

        let big = [AdData::new(ADV_TYPE_MANUFACTURER_SPECIFIC, vec![1u8; 252])];
        assert!(matches!(host.adv_set_data(handle, &big, &[]), Err(Error::RetryLater)));
        // Data that fits one command is fine.
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
    }

    #[test]
    fn test_enable_twice_and_delete_enabled() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let handle = host.adv_create(AdvParams::default()).unwrap();
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
        let start = AdvStartParams {
            timeout: 500,
            num_events: 0,
        };
        host.adv_enable(handle, start).unwrap();

        assert!(matches!(host.adv_enable(handle, start), Err(Error::Already)));
        assert!(matches!(host.adv_delete(handle), Err(Error::Busy)));
        // The controller bounds extended advertising itself.
        assert!(!host.adv_set(handle).unwrap().flags().contains(AdvFlags::LIMITED));
        assert!(host
            .driver()
            .sent(|c| matches!(c, HciCommand::LeSetExtAdvEnable { enable: true, sets }
                if sets[0].duration == 500))
            .len()
            == 1);

        host.adv_disable(handle).unwrap();
        host.adv_delete(handle).unwrap();
        assert_eq!(
            host.driver().sent(|c| *c == HciCommand::LeRemoveAdvSet { handle: handle.index }).len(),
            1
        );
        assert!(matches!(
            host.adv_set_data(handle, &[flags()], &[]),
            Err(Error::InvalidParameter(_))
        ));

        // A new set in the same slot gets a new generation.
        let again = host.adv_create(AdvParams::default()).unwrap();
        assert_eq!(again.index, handle.index);
        assert_ne!(again.generation, handle.generation);
    }

    #[test]
    fn test_enable_failure_releases_connection_object() {
        let mut host = host();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        host.register_conn_callback(Box::new(move |e| sink.lock().unwrap().push(e.clone())));
        host.driver_mut()
            .fail_next(opcode(OGF_LE, OCF_LE_SET_ADV_ENABLE), HCI_ERR_INVALID_PARAM);

        assert!(host.adv_start(connectable(), &[flags()], &[]).is_err());
        host.process();
        assert_eq!(host.conns().in_use(), 0);
        let events = events.lock().unwrap();
        assert!(!events.iter().any(|e| matches!(e, ConnEvent::Connected { .. })));
    }

    #[test]
    fn test_directed_advertising_needs_connection_object() {
        let config = HostConfig {
            max_conn: 1,
            ..HostConfig::default()
        };
        let mut host = host_with(MockController::default(), config);
        deliver(&mut host, &[le_conn_complete(0x40, ROLE_PERIPHERAL, &peer())]);

        let other = LeAddr::public([9, 9, 9, 9, 9, 9]);
        let directed = AdvParams {
            options: AdvOptions::CONNECTABLE,
            peer: Some(other),
            ..AdvParams::default()
        };
        let handle = host.adv_create(directed).unwrap();
        host.adv_set_data(handle, &[], &[]).unwrap();
        assert!(matches!(
            host.adv_enable(handle, AdvStartParams::default()),
            Err(Error::ResourceExhausted(_))
        ));
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::DataSet);

        // Directed at a peer we are already connected to
        let same = AdvParams {
            options: AdvOptions::CONNECTABLE,
            peer: Some(peer()),
            ..AdvParams::default()
        };
        host.adv_delete(handle).unwrap();
        let handle = host.adv_create(same).unwrap();
        assert!(matches!(
            host.adv_enable(handle, AdvStartParams::default()),
            Err(Error::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_undirected_advertising_without_free_object() {
        let config = HostConfig {
            max_conn: 1,
            ..HostConfig::default()
        };
        let mut host = host_with(MockController::default(), config);
        deliver(&mut host, &[le_conn_complete(0x40, ROLE_PERIPHERAL, &peer())]);

        let handle = host.adv_start(connectable(), &[flags()], &[]).unwrap();
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::Enabled);
    }

    #[test]
    fn test_legacy_connection_through_set() {
        let mut host = host();
        let events = record(&mut host);
        let handle = host.adv_start(connectable(), &[flags()], &[]).unwrap();

        deliver(&mut host, &[le_conn_complete(0x40, ROLE_PERIPHERAL, &peer())]);
        let conn = host.conn_by_handle(0x40).unwrap();
        assert_eq!(conn.lock().adv_handle, Some(handle.index));
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::DataSet);
        assert_eq!(
            *events.lock().unwrap(),
            vec![AdvEvent::Connected {
                set: handle,
                conn: conn.id()
            }]
        );
        assert_eq!(host.conns().in_use(), 1);
    }

    #[test]
    fn test_set_terminated_by_connection() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let events = record(&mut host);
        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV | AdvOptions::CONNECTABLE,
                ..AdvParams::default()
            })
            .unwrap();
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams::default()).unwrap();

        deliver(
            &mut host,
            &[
                le_conn_complete(0x40, ROLE_PERIPHERAL, &peer()),
                adv_set_terminated(HCI_SUCCESS, handle.index, 0x40),
            ],
        );
        let conn = host.conn_by_handle(0x40).unwrap();
        assert_eq!(conn.lock().state, ConnState::Connected);
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::DataSet);
        assert_eq!(
            *events.lock().unwrap(),
            vec![AdvEvent::Connected {
                set: handle,
                conn: conn.id()
            }]
        );
        assert_eq!(host.conns().in_use(), 1);
    }

    #[test]
    fn test_directed_set_timeout_fails_connection() {
        let mut host = host_with(ext_controller(), HostConfig::default());
        let adv_events = record(&mut host);
        let conn_events = Arc::new(Mutex::new(Vec::new()));
        let sink = conn_events.clone();
        host.register_conn_callback(Box::new(move |e| sink.lock().unwrap().push(e.clone())));

        let handle = host
            .adv_create(AdvParams {
                options: AdvOptions::EXT_ADV | AdvOptions::CONNECTABLE | AdvOptions::DIR_LOW_DUTY,
                peer: Some(peer()),
                ..AdvParams::default()
            })
            .unwrap();
        host.adv_set_data(handle, &[], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams { timeout: 100, num_events: 0 }).unwrap();
        assert!(host.conns().find(|c| c.state == ConnState::AdvDirConnectable).is_some());

        deliver(&mut host, &[adv_set_terminated(HCI_ERR_ADV_TIMEOUT, handle.index, 0)]);
        assert_eq!(host.conns().in_use(), 0);
        assert!(matches!(
            conn_events.lock().unwrap()[0],
            ConnEvent::Connected { status: HCI_ERR_ADV_TIMEOUT, .. }
        ));
        assert_eq!(
            *adv_events.lock().unwrap(),
            vec![AdvEvent::Terminated {
                set: handle,
                reason: HCI_ERR_ADV_TIMEOUT
            }]
        );
        assert!(!host.adv_set(handle).unwrap().flags().contains(AdvFlags::PERSIST));
    }

    #[test]
    fn test_legacy_duration_uses_host_timer() {
        let mut host = host();
        let events = record(&mut host);
        let handle = host.adv_create(AdvParams::default()).unwrap();
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams { timeout: 100, num_events: 0 }).unwrap();
        assert!(host.adv_set(handle).unwrap().flags().contains(AdvFlags::LIMITED));
        assert!(host.next_deadline().is_some());

        host.process_timeouts(Instant::now() + Duration::from_secs(2));
        assert_eq!(host.adv_set(handle).unwrap().state(), AdvState::DataSet);
        assert_eq!(
            host.driver().sent(|c| *c == HciCommand::LeSetAdvertisingEnable { enable: false }).len(),
            1
        );
        assert_eq!(
            *events.lock().unwrap(),
            vec![AdvEvent::Terminated {
                set: handle,
                reason: HCI_ERR_ADV_TIMEOUT
            }]
        );
    }

    #[test]
    fn test_refused_disable_keeps_set_enabled() {
        let mut host = host();
        let handle = host.adv_create(AdvParams::default()).unwrap();
        host.adv_set_data(handle, &[flags()], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams { timeout: 100, num_events: 0 }).unwrap();

        host.driver_mut()
            .fail_next(opcode(OGF_LE, OCF_LE_SET_ADV_ENABLE), HCI_ERR_UNSPECIFIED);
        assert!(matches!(
            host.adv_disable(handle),
            Err(Error::Controller { status: HCI_ERR_UNSPECIFIED, .. })
        ));
        let set = host.adv_set(handle).unwrap();
        assert_eq!(set.state(), AdvState::Enabled);
        assert!(set.flags().contains(AdvFlags::LIMITED));
        assert!(host.next_deadline().is_some());

        host.adv_disable(handle).unwrap();
        let set = host.adv_set(handle).unwrap();
        assert_eq!(set.state(), AdvState::DataSet);
        assert!(!set.flags().contains(AdvFlags::LIMITED));
        assert!(host.next_deadline().is_none());
    }

    #[test]
    fn test_non_connectable_set_uses_private_address() {
        let mut host = host();
        let handle = host.adv_create(AdvParams::default()).unwrap();
        let addr = host.adv_set(handle).unwrap().random_addr().unwrap();
        assert!(addr.is_nrpa());

        host.adv_set_data(handle, &[], &[]).unwrap();
        host.adv_enable(handle, AdvStartParams::default()).unwrap();
        assert_eq!(
            host.driver().sent(|c| *c == HciCommand::LeSetRandomAddress { addr }).len(),
            1
        );
    }

    fn resume_after_disconnect(auto_resume: bool) -> usize {
        let config = HostConfig {
            max_conn: 1,
            adv_auto_resume: auto_resume,
            ..HostConfig::default()
        };
        let mut host = host_with(MockController::default(), config);
        host.adv_start(connectable(), &[flags()], &[]).unwrap();
        deliver(&mut host, &[le_conn_complete(0x40, ROLE_PERIPHERAL, &peer())]);
        deliver(&mut host, &[disconn_complete(0x40, HCI_ERR_REMOTE_USER_TERM_CONN)]);
        host.driver()
            .sent(|c| *c == HciCommand::LeSetAdvertisingEnable { enable: true })
            .len()
    }

    #[test]
    fn test_auto_resume_only_when_configured() {
        assert_eq!(resume_after_disconnect(false), 1);
        assert_eq!(resume_after_disconnect(true), 2);
    }
}

mod common;

use common::*;
use sge::IntrParams;
use sge::net::Frag;
use sge::sge::msg::RspType;
use sge::sge::{FlConfig, IqState, ServiceResult};

fn fl_config(h: &Harness, capacity: u16, lowat: u16, bufs: u32) -> FlConfig {
	FlConfig {
		capacity,
		lowat,
		pool: h.pool(2048, bufs),
	}
}

#[test]
fn delivers_frames_with_device_metadata() {
	let params = params();
	let h = Harness::new(params.clone());
	let cfg = fl_config(&h, 64, 8, 128);
	let iq = h.sge.alloc_rxq(3, &iq_config(64), cfg, ids(10, Some(20))).unwrap();
	let fl = iq.free_list().unwrap();
	assert_eq!(fl.cntxt_id(), 20);
	assert_eq!(fl.posted(), 56);
	assert_eq!(h.adapter.fl_doorbells().iter().map(|(_, n)| n).sum::<u16>(), 7);
	assert_eq!(h.adapter.gts(), [(10, 0, IntrParams::default())]);

	let mut dev = IqProducer::new(&iq);
	let mut bufs = FlConsumer::new(fl, &params);
	let short = frame(60, 1);
	let long = frame(1500, 7);
	let len = bufs.fill(&short);
	dev.push(rx_pkt(len, true, Some(5)), RspType::FlBuf);
	let len = bufs.fill(&long);
	dev.push(rx_pkt(len, false, None), RspType::FlBuf);

	h.sge.intr(&iq);

	let rx = h.received();
	assert_eq!(rx.len(), 2);
	let (index, pkt) = &rx[0];
	assert_eq!(*index, 3);
	assert_eq!(pkt.to_vec(), short);
	assert!(pkt.rx.csum_ok);
	assert_eq!(pkt.rx.vlan, Some(5));
	assert_eq!(pkt.rx.rss_hash, RSS_HASH);
	assert!(matches!(pkt.frags(), [Frag::Owned(_)]));

	let (_, pkt) = &rx[1];
	assert_eq!(pkt.to_vec(), long);
	assert!(!pkt.rx.csum_ok);
	assert_eq!(pkt.rx.vlan, None);
	assert!(matches!(pkt.frags(), [Frag::Shared(_)]));

	let stats = iq.stats();
	assert_eq!(stats.rx_pkts, 2);
	assert_eq!(stats.rx_bytes, 1560);
	assert_eq!(stats.csum_ok, 1);
	assert_eq!(stats.vlan_ex, 1);
	let fl_stats = iq.fl_stats().unwrap();
	assert_eq!(fl_stats.copied, 1);
	assert_eq!(fl_stats.zero_copy, 1);
	// Both buffers were replaced before the queue was re-armed.
	assert_eq!(fl.posted(), 56);
	assert_eq!(h.adapter.last_gts(), Some((10, 2, IntrParams::default())));
}

#[test]
fn firmware_messages_and_unknown_opcodes() {
	let h = Harness::new(params());
	let fwq = h.fwq(1);
	let mut dev = IqProducer::new(&fwq);
	dev.push(unknown_cpl(0x99), RspType::Cpl);
	dev.push(fw_msg(2, [1, 2, 3, 4]), RspType::Cpl);
	dev.push(egr_update(77), RspType::Cpl);

	h.sge.intr(&fwq);

	let fw = h.stack.fw.lock().unwrap().clone();
	assert_eq!(fw.len(), 1);
	let (iq, msg) = fw[0];
	assert_eq!(iq, 1);
	assert_eq!(msg.kind, 2);
	assert_eq!(msg.data, [1, 2, 3, 4]);

	let stats = fwq.stats();
	assert_eq!(stats.unknown_cpl, 1);
	assert_eq!(stats.fw_msgs, 1);
	assert_eq!(h.adapter.last_gts(), Some((1, 3, IntrParams::default())));
	assert!(h.received().is_empty());
}

#[test]
fn polling_honours_the_budget() {
	let h = Harness::new(params());
	let cfg = sge::IqConfig {
		polling: true,
		..iq_config(64)
	};
	let iq = h.sge.alloc_fwq(&cfg, ids(1, None)).unwrap();
	// Polled queues are never armed.
	assert!(h.adapter.gts().is_empty());

	let mut dev = IqProducer::new(&iq);
	for kind in 0..5 {
		dev.push(fw_msg(kind, [0; 4]), RspType::Cpl);
	}

	assert_eq!(h.sge.poll(&iq, 3), ServiceResult::MoreWork);
	assert_eq!(h.stack.fw.lock().unwrap().len(), 3);
	assert_eq!(h.adapter.last_gts(), Some((1, 3, IntrParams::UPDATE_ONLY)));

	assert_eq!(h.sge.poll(&iq, 3), ServiceResult::Done);
	assert_eq!(h.stack.fw.lock().unwrap().len(), 5);
	assert_eq!(h.adapter.last_gts(), Some((1, 2, IntrParams::UPDATE_ONLY)));

	assert_eq!(h.sge.poll(&iq, 3), ServiceResult::Done);
	assert_eq!(h.adapter.last_gts(), Some((1, 0, IntrParams::UPDATE_ONLY)));
}

#[test]
fn unknown_response_types_are_skipped() {
	let h = Harness::new(params());
	let fwq = h.fwq(1);
	let mut dev = IqProducer::new(&fwq);
	dev.push_raw(fw_msg(7, [0; 4]), 3);
	dev.push(fw_msg(8, [0; 4]), RspType::Cpl);

	h.sge.intr(&fwq);

	let kinds: Vec<u8> = h.stack.fw.lock().unwrap().iter().map(|(_, m)| m.kind).collect();
	assert_eq!(kinds, [8]);
	let stats = fwq.stats();
	assert_eq!(stats.unknown_rsp, 1);
	assert_eq!(stats.fw_msgs, 1);
	assert_eq!(h.adapter.last_gts(), Some((1, 2, IntrParams::default())));
}

#[test]
fn generation_flips_when_the_ring_wraps() {
	let h = Harness::new(params());
	let iq = h.sge.alloc_fwq(&iq_config(4), ids(1, None)).unwrap();
	let mut dev = IqProducer::new(&iq);

	for round in 0..3u8 {
		for kind in 0..3 {
			dev.push(fw_msg(round * 3 + kind, [0; 4]), RspType::Cpl);
		}
		h.sge.intr(&iq);
	}

	let kinds: Vec<u8> = h.stack.fw.lock().unwrap().iter().map(|(_, m)| m.kind).collect();
	assert_eq!(kinds, (0..9).collect::<Vec<_>>());
}

#[test]
fn forwarded_interrupts_service_the_source_queue() {
	let params = params();
	let h = Harness::new(params.clone());
	let fwq = h.fwq(1);
	let cfg = fl_config(&h, 64, 8, 128);
	let rxq = h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(10, Some(20))).unwrap();

	let mut fw_dev = IqProducer::new(&fwq);
	let mut rx_dev = IqProducer::new(&rxq);
	let mut bufs = FlConsumer::new(rxq.free_list().unwrap(), &params);
	let data = frame(128, 3);
	let len = bufs.fill(&data);
	rx_dev.push(rx_pkt(len, true, None), RspType::FlBuf);
	fw_dev.push(forwarded(10), RspType::Intr);
	fw_dev.push(forwarded(99), RspType::Intr);

	h.sge.intr_all();

	let rx = h.received();
	assert_eq!(rx.len(), 1);
	assert_eq!(rx[0].1.to_vec(), data);
	assert_eq!(fwq.stats().forwarded, 2);
	assert_eq!(rxq.stats().rx_pkts, 1);
	assert_eq!(rxq.state(), IqState::Idle);
	assert_eq!(fwq.state(), IqState::Idle);
	assert!(h.adapter.gts().contains(&(10, 1, IntrParams::default())));
}

#[test]
fn busy_forwarding_queue_gets_another_pass() {
	let h = Harness::new(params());
	let fwq = h.fwq(1);
	let cfg = fl_config(&h, 64, 8, 128);
	let rxq = h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(10, Some(20))).unwrap();

	// The rx queue forwards back to the firmware queue, which is still
	// being serviced at that point.
	IqProducer::new(&fwq).push(forwarded(10), RspType::Intr);
	IqProducer::new(&rxq).push(forwarded(1), RspType::Intr);

	h.sge.intr(&fwq);

	assert_eq!(fwq.stats().forwarded, 1);
	assert_eq!(rxq.stats().forwarded, 1);
	assert_eq!(fwq.state(), IqState::Idle);
	assert_eq!(rxq.state(), IqState::Idle);
	let fwq_gts: Vec<_> = h.adapter.gts().into_iter().filter(|(id, ..)| *id == 1).collect();
	let arm = IntrParams::default();
	assert_eq!(fwq_gts, [(1, 0, arm), (1, 1, arm), (1, 0, arm)]);
}

#[test]
fn payload_without_a_buffer_waits_for_the_refill() {
	let params = params();
	let h = Harness::new(params.clone());
	let pool = h.pool(2048, 20);
	let held: Vec<_> = (0..15).map(|_| pool.alloc().unwrap()).collect();
	let cfg = FlConfig {
		capacity: 64,
		lowat: 8,
		pool,
	};
	let iq = h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(10, Some(20))).unwrap();
	let fl = iq.free_list().unwrap();
	assert_eq!(fl.posted(), 5);

	let mut dev = IqProducer::new(&iq);
	let mut bufs = FlConsumer::new(fl, &params);
	for seed in 0..5 {
		let len = bufs.fill(&frame(60, seed));
		dev.push(rx_pkt(len, true, None), RspType::FlBuf);
	}
	// The device reports a sixth payload before its buffer is posted.
	let late = frame(60, 5);
	let late_len = u32::from(params.fl_pktshift) + 60;
	dev.push(rx_pkt(late_len, true, None), RspType::FlBuf);

	h.sge.intr(&iq);
	assert_eq!(h.received().len(), 5);
	assert_eq!(iq.stats().nobuf, 1);
	assert_eq!(h.adapter.last_gts(), Some((10, 5, IntrParams::STARVED)));

	drop(held);
	h.sge.starvation_tick();
	assert!(fl.posted() > 0);
	assert_eq!(bufs.fill(&late), late_len);

	h.sge.intr(&iq);
	let rx = h.received();
	assert_eq!(rx.len(), 1);
	assert_eq!(rx[0].1.to_vec(), late);
	assert_eq!(iq.stats().rx_pkts, 6);
	assert_eq!(iq.stats().nobuf, 1);
	assert_eq!(h.adapter.last_gts(), Some((10, 1, IntrParams::default())));
}

#[test]
fn starving_free_list_is_refilled_by_the_timer() {
	let h = Harness::new(params());
	let pool = h.pool(2048, 20);
	// Someone else holds 15 of the 20 buffers.
	let held: Vec<_> = (0..15).map(|_| pool.alloc().unwrap()).collect();
	let cfg = FlConfig {
		capacity: 256,
		lowat: 8,
		pool,
	};
	let iq = h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(10, Some(20))).unwrap();
	let fl = iq.free_list().unwrap();

	assert_eq!(fl.posted(), 5);
	assert!(fl.is_starving());
	assert_eq!(h.sge.starving_count(), 1);
	assert_eq!(h.ticker.armed(), 1);
	assert_eq!(iq.fl_stats().unwrap().starving, 1);

	// Nothing to be had yet; the list stays under watch.
	h.sge.starvation_tick();
	assert_eq!(h.sge.starving_count(), 1);
	assert_eq!(h.ticker.cancelled(), 0);

	drop(held);
	h.sge.starvation_tick();
	assert_eq!(fl.posted(), 20);
	assert!(!fl.is_starving());
	assert_eq!(h.sge.starving_count(), 0);
	assert_eq!(h.ticker.cancelled(), 1);
	assert_eq!(h.adapter.fl_doorbells().iter().map(|(_, n)| n).sum::<u16>(), 2);
}

#[test]
fn freed_queues_leave_the_starving_list() {
	let h = Harness::new(params());
	let cfg = fl_config(&h, 64, 8, 4);
	let iq = h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(10, Some(20))).unwrap();
	assert_eq!(h.sge.starving_count(), 1);

	h.sge.free_rxq(&iq);
	h.sge.free_rxq(&iq);
	assert_eq!(h.sge.starving_count(), 0);
	assert_eq!(iq.state(), IqState::Disabled);
	assert!(h.sge.iq(10).is_none());
	assert_eq!(iq.free_list().unwrap().posted(), 0);

	// A disabled queue ignores its interrupts.
	let mut dev = IqProducer::new(&iq);
	dev.push(fw_msg(0, [0; 4]), RspType::Cpl);
	h.sge.intr(&iq);
	assert_eq!(iq.stats().fw_msgs, 0);
}

#[test]
fn duplicate_contexts_are_refused() {
	let h = Harness::new(params());
	h.fwq(1);
	assert!(matches!(
		h.sge.alloc_fwq(&iq_config(64), ids(2, None)),
		Err(sge::SgeError::Duplicate(1))
	));

	let cfg = fl_config(&h, 64, 8, 128);
	assert!(matches!(
		h.sge.alloc_rxq(0, &iq_config(64), cfg, ids(1, Some(20))),
		Err(sge::SgeError::Duplicate(1))
	));
}

#[test]
fn error_interrupt_reaches_the_driver() {
	let h = Harness::new(params());
	h.sge.intr_err();
	assert_eq!(h.stack.errors.load(std::sync::atomic::Ordering::Relaxed), 1);
}

//! Worker pool, task queues, handles and timers.

use std::net::UdpSocket;
use std::sync::mpsc;
use std::sync::{Arc, Barrier, Mutex};
use std::time::{Duration, Instant};

use netmgr::{check_addr, HandleData, Manager, NetError, SockType, Timer};

mod common;
use common::{localhost, WAIT};

#[test]
fn tasks_for_one_worker_run_in_order() {
    let mgr = common::manager(2);
    let seen = Arc::new(Mutex::new(Vec::new()));
    for i in 0..100 {
        let seen = seen.clone();
        mgr.task_enqueue(move || seen.lock().unwrap().push((i, Manager::tid())), Some(0));
    }

    assert!(common::wait_until(WAIT, || seen.lock().unwrap().len() == 100));
    let seen = seen.lock().unwrap();
    assert!(seen.iter().enumerate().all(|(n, &(i, tid))| n == i && tid == Some(0)));
    drop(seen);
    mgr.destroy();
}

#[test]
fn worker_index_wraps() {
    let mgr = common::manager(2);
    let (tx, rx) = mpsc::channel();
    mgr.task_enqueue(move || tx.send(Manager::tid()).unwrap(), Some(5));
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Some(1));
    assert_eq!(Manager::tid(), None);
    mgr.destroy();
}

#[test]
fn offloaded_work_returns_to_its_worker() {
    let mgr = common::manager(2);
    let (tx, rx) = mpsc::channel();
    let offloader = mgr.clone();
    mgr.task_enqueue(
        move || {
            let tx = tx.clone();
            offloader.work_offload(
                || {
                    std::thread::sleep(Duration::from_millis(20));
                    Manager::tid()
                },
                move |result| {
                    tx.send((result, Manager::tid())).unwrap();
                },
            );
        },
        Some(1),
    );

    let (result, tid) = rx.recv_timeout(WAIT).unwrap();
    assert_eq!(result, Ok(None));
    assert_eq!(tid, Some(1));
    mgr.destroy();
}

#[test]
#[should_panic(expected = "worker thread")]
fn offload_outside_a_worker_panics() {
    let mgr = common::manager(1);
    mgr.work_offload(|| (), |_| {});
}

#[test]
fn destroy_waits_for_other_references() {
    let mgr = common::manager(1);
    let other = mgr.clone();
    let start = Instant::now();
    let holder = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(200));
        drop(other);
    });

    mgr.destroy();
    assert!(start.elapsed() >= Duration::from_millis(200));
    holder.join().unwrap();
}

#[test]
fn pause_and_resume_from_outside_the_pool() {
    let mgr = common::manager(3);
    mgr.pause();
    let (tx, rx) = mpsc::channel();
    mgr.task_enqueue(move || tx.send(()).unwrap(), Some(2));
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    mgr.resume();
    rx.recv_timeout(WAIT).unwrap();
    mgr.destroy();
}

fn udp_round_trip(addr: std::net::SocketAddr, message: &[u8]) -> Vec<u8> {
    let client = UdpSocket::bind(localhost()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    client.send_to(message, addr).unwrap();
    let mut buf = [0u8; 64];
    let (n, _) = client.recv_from(&mut buf).unwrap();
    buf[..n].to_vec()
}

#[test]
fn listeners_start_while_paused() {
    let mgr = common::manager(2);
    mgr.pause();

    let (tx, rx) = mpsc::channel();
    let starter = mgr.clone();
    std::thread::spawn(move || {
        let udp = starter.listen_udp(localhost(), common::echo);
        let tcpdns = starter.listen_tcpdns(localhost(), common::echo, None, 16, None);
        tx.send((udp, tcpdns)).unwrap();
    });
    let (udp, tcpdns) = rx.recv_timeout(WAIT).expect("listen blocked on paused workers");
    let (udp, tcpdns) = (udp.unwrap(), tcpdns.unwrap());

    mgr.resume();
    assert_eq!(udp_round_trip(udp.local_addr(), b"late"), b"late");
    let mut stream = common::blocking_stream(tcpdns.local_addr());
    common::write_frame(&mut stream, b"framed");
    assert_eq!(common::read_frame(&mut stream).unwrap(), b"framed");

    drop(stream);
    udp.stop_listening();
    tcpdns.stop_listening();
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn workers_listen_concurrently() {
    let mgr = common::manager(2);
    let barrier = Arc::new(Barrier::new(2));
    let (tx, rx) = mpsc::channel();
    for tid in 0..2 {
        let starter = mgr.clone();
        let barrier = barrier.clone();
        let tx = tx.clone();
        mgr.task_enqueue(
            move || {
                barrier.wait();
                let started = starter.listen_udp(localhost(), common::echo);
                tx.send(started).unwrap();
            },
            Some(tid),
        );
    }

    let first = rx.recv_timeout(WAIT).expect("listen from a worker never returned");
    let second = rx.recv_timeout(WAIT).expect("listen from a worker never returned");
    for listener in [first.unwrap(), second.unwrap()] {
        assert_eq!(udp_round_trip(listener.local_addr(), b"ping"), b"ping");
        listener.stop_listening();
    }

    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn handle_references_survive_concurrent_clones() {
    let mgr = common::manager(1);
    let peer = UdpSocket::bind(localhost()).unwrap();
    let handle = common::connect(|cb| {
        mgr.udp_connect(localhost(), peer.local_addr().unwrap(), cb, WAIT)
    })
    .unwrap();
    let base = handle.references();

    let threads: Vec<_> = (0..8)
        .map(|_| {
            let handle = handle.clone();
            std::thread::spawn(move || {
                for _ in 0..1000 {
                    let copy = handle.clone();
                    assert!(copy.references() > 1);
                    drop(copy);
                }
            })
        })
        .collect();
    for t in threads {
        t.join().unwrap();
    }

    assert_eq!(handle.references(), base);
    drop(handle);
    assert!(common::wait_until(WAIT, || mgr.socket_count() == 0));
    mgr.destroy();
}

#[test]
fn handle_payload_is_reset_and_reused() {
    let mgr = common::manager(1);
    let listener = mgr
        .listen_udp(localhost(), |handle, result| {
            if result.is_err() {
                return;
            }
            let before = handle.data::<u32>();
            handle.set_data(HandleData::new(7u32).on_reset(|v: &mut u32| *v = 0));
            let reply = match before {
                None => b"none".to_vec(),
                Some(v) => v.to_string().into_bytes(),
            };
            handle.send(reply, |_, _| {});
        })
        .unwrap();

    let client = UdpSocket::bind(localhost()).unwrap();
    client.set_read_timeout(Some(WAIT)).unwrap();
    let mut replies = Vec::new();
    for _ in 0..2 {
        client.send_to(b"q", listener.local_addr()).unwrap();
        let mut buf = [0u8; 16];
        let n = client.recv(&mut buf).unwrap();
        replies.push(buf[..n].to_vec());
    }
    assert_eq!(replies, vec![b"none".to_vec(), b"0".to_vec()]);
    mgr.destroy();
}

#[test]
fn timer_fires_unless_stopped() {
    let mgr = common::manager(1);
    let peer = UdpSocket::bind(localhost()).unwrap();
    let handle = common::connect(|cb| {
        mgr.udp_connect(localhost(), peer.local_addr().unwrap(), cb, WAIT)
    })
    .unwrap();

    let (tx, rx) = mpsc::channel();
    let timer = Timer::new(&handle, move |_, result| {
        let _ = tx.send(result);
    });
    timer.start(Duration::from_millis(50));
    assert!(timer.is_running());
    assert_eq!(rx.recv_timeout(WAIT).unwrap(), Ok(()));
    assert!(!timer.is_running());

    timer.start(Duration::from_millis(50));
    timer.stop();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    drop(timer);
    drop(handle);
    mgr.destroy();
}

#[test]
fn address_checks() {
    let taken = std::net::TcpListener::bind(localhost()).unwrap();
    let addr = taken.local_addr().unwrap();
    assert_eq!(check_addr(addr, SockType::Tcp), Err(NetError::AddressInUse));
    assert_eq!(check_addr(localhost(), SockType::Udp), Ok(()));
    assert_eq!(check_addr(localhost(), SockType::Unix), Err(NetError::NotImplemented));
}

#[test]
fn routing_sockets_are_not_implemented() {
    let mgr = common::manager(1);
    assert_eq!(mgr.route_connect(|_| {}), Err(NetError::NotImplemented));
    mgr.destroy();
}

#[test]
fn operations_after_destroy_fail() {
    let mgr = common::manager(1);
    let weak_view = {
        let peer = UdpSocket::bind(localhost()).unwrap();
        let handle = common::connect(|cb| {
            mgr.udp_connect(localhost(), peer.local_addr().unwrap(), cb, WAIT)
        })
        .unwrap();
        assert!(handle.manager().is_some());
        handle
    };

    mgr.destroy();
    assert!(weak_view.manager().is_none());
    assert_eq!(common::send_sync(&weak_view, b"late"), Err(NetError::Canceled));
}

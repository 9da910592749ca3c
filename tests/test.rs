use asyn::{
    AsynError, AsynManager, AsynResult, AsynUser, CancelStatus, Common, EchoDriver, EchoOptions, EomReason,
    EosInterpose, Exception, ManagerConfig, Octet, PortAttributes, PortConfig, Priority, Request,
};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// Octet layer that records its tag and forwards to the layer below.
struct TaggingLayer {
    tag: &'static str,
    log: Arc<Mutex<Vec<&'static str>>>,
    lower: Mutex<Option<asyn::Interface<dyn Octet>>>,
}

impl TaggingLayer {
    fn new(tag: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
        Arc::new(Self {
            tag,
            log: Arc::clone(log),
            lower: Mutex::new(None),
        })
    }
}

impl Octet for TaggingLayer {
    fn write(&self, user: &AsynUser, data: &[u8]) -> AsynResult<usize> {
        self.log.lock().unwrap().push(self.tag);
        match self.lower.lock().unwrap().as_ref() {
            Some(lower) => lower.write(user, data),
            None => Ok(data.len()),
        }
    }

    fn read(&self, _user: &AsynUser, _buf: &mut [u8]) -> AsynResult<(usize, EomReason)> {
        Ok((0, EomReason::END))
    }
}

/// Driver that connects instantly and records nothing else.
struct NullDriver {
    port: asyn::PortHandle,
}

impl Common for NullDriver {
    fn connect(&self, user: &AsynUser) -> AsynResult {
        self.port.exception_connect(user.addr()?)
    }

    fn disconnect(&self, user: &AsynUser) -> AsynResult {
        self.port.exception_disconnect(user.addr()?)
    }
}

fn echo_manager(name: &str, attributes: PortAttributes, options: EchoOptions) -> (AsynManager, Arc<EchoDriver>) {
    let manager = AsynManager::new(ManagerConfig::default().with_reconnect_interval(Duration::from_millis(50)));
    let port = manager
        .register_port(name, PortConfig::new(attributes))
        .expect("register_port failed");
    let driver = EchoDriver::new(port, options);
    driver.register().expect("driver registration failed");
    (manager, driver)
}

fn connected_user(manager: &AsynManager, port: &str) -> AsynUser {
    let user = manager.create_user();
    manager.connect_device(&user, port, 0).expect("connect_device failed");
    manager
        .wait_connect(&user, Duration::from_secs(2))
        .expect("port did not connect");
    user
}

#[test]
fn test_high_priority_runs_before_low() {
    let (manager, _driver) = echo_manager(
        "prio",
        PortAttributes::CAN_BLOCK,
        EchoOptions {
            delay: Duration::from_millis(100),
            ..Default::default()
        },
    );
    let busy = connected_user(&manager, "prio");
    let a = connected_user(&manager, "prio");
    let b = connected_user(&manager, "prio");
    let order = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = mpsc::channel();

    let octet = manager.find_interface::<dyn Octet>(&busy, true).unwrap();
    manager
        .queue_request(
            &busy,
            Priority::Medium,
            Request::new(move |user| {
                octet.write(user, b"busy").unwrap();
            }),
        )
        .unwrap();

    for (user, priority, name) in [(&a, Priority::Low, "A"), (&b, Priority::High, "B")] {
        let order = Arc::clone(&order);
        let done_tx = done_tx.clone();
        manager
            .queue_request(
                user,
                priority,
                Request::new(move |_| {
                    order.lock().unwrap().push(name);
                    done_tx.send(()).unwrap();
                }),
            )
            .unwrap();
    }

    for _ in 0..2 {
        done_rx.recv_timeout(Duration::from_secs(2)).expect("request never ran");
    }
    assert_eq!(*order.lock().unwrap(), vec!["B", "A"]);
}

#[test]
fn test_second_request_is_already_queued() {
    let (manager, _driver) = echo_manager("dup", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let holder = connected_user(&manager, "dup");
    let user = connected_user(&manager, "dup");
    manager.lock(&holder, Duration::from_millis(100)).unwrap();

    manager
        .queue_request(&user, Priority::Low, Request::new(|_| panic!("must not run")))
        .unwrap();
    let err = manager.queue_request(&user, Priority::High, Request::new(|_| ()));
    assert_eq!(err, Err(AsynError::AlreadyQueued));
    assert!(user.is_queued());

    assert_eq!(manager.cancel_request(&user), CancelStatus::Cancelled);
    assert_eq!(manager.cancel_request(&user), CancelStatus::NotQueued);
    assert!(!user.is_queued());
    manager.unlock(&holder).unwrap();
}

#[test]
fn test_queue_timeout_calls_timeout_callback() {
    let (manager, _driver) = echo_manager("qto", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let holder = connected_user(&manager, "qto");
    let user = connected_user(&manager, "qto");
    manager.lock(&holder, Duration::from_millis(100)).unwrap();

    let (tx, rx) = mpsc::channel();
    let timeout_tx = tx.clone();
    let request = Request::new(move |_| tx.send("processed").unwrap())
        .with_timeout(Duration::from_millis(100), move |_| timeout_tx.send("timeout").unwrap());
    manager.queue_request(&user, Priority::Medium, request).unwrap();

    assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok("timeout"));
    assert!(!user.is_queued());
    manager.unlock(&holder).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(100)).is_err());
}

#[test]
fn test_non_blocking_port_runs_inline() {
    let (manager, _driver) = echo_manager("inline", PortAttributes::NONE, EchoOptions::default());
    let user = connected_user(&manager, "inline");
    let caller = thread::current().id();
    let ran_on = Arc::new(Mutex::new(None));
    let slot = Arc::clone(&ran_on);
    manager
        .queue_request(
            &user,
            Priority::Low,
            Request::new(move |_| *slot.lock().unwrap() = Some(thread::current().id())),
        )
        .unwrap();
    assert_eq!(*ran_on.lock().unwrap(), Some(caller));
    assert!(!user.is_queued());
}

#[test]
fn test_requeue_right_after_completion() {
    let (manager, _driver) = echo_manager("again", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let user = connected_user(&manager, "again");
    let (tx, rx) = mpsc::channel();

    for round in 0..1000 {
        let tx = tx.clone();
        manager
            .queue_request(&user, Priority::Medium, Request::new(move |_| tx.send(round).unwrap()))
            .unwrap_or_else(|e| panic!("round {}: {}", round, e));
        assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(round));
        assert!(!user.is_queued());
        assert_ne!(manager.cancel_request(&user), CancelStatus::Cancelled);
    }
}

#[test]
fn test_callback_queues_follow_up() {
    for (name, attributes) in [("chain-block", PortAttributes::CAN_BLOCK), ("chain-inline", PortAttributes::NONE)] {
        let (manager, _driver) = echo_manager(name, attributes, EchoOptions::default());
        let manager = Arc::new(manager);
        let user = connected_user(&manager, name);
        let (tx, rx) = mpsc::channel();

        let follow_up = {
            let tx = tx.clone();
            Request::new(move |_| tx.send("second").unwrap())
        };
        let inner = Arc::clone(&manager);
        let first = Request::new(move |user| {
            tx.send("first").unwrap();
            inner.queue_request(user, Priority::Low, follow_up).unwrap();
        });
        manager.queue_request(&user, Priority::High, first).unwrap();

        for expected in ["first", "second"] {
            assert_eq!(rx.recv_timeout(Duration::from_secs(2)), Ok(expected), "port {}", name);
        }
        assert!(!user.is_queued());
    }
}

#[test]
fn test_interpose_three_layers() {
    let manager = AsynManager::default();
    let port = manager
        .register_port("layers", PortConfig::new(PortAttributes::NONE))
        .unwrap();
    let log = Arc::new(Mutex::new(Vec::new()));

    let base = TaggingLayer::new("base", &log);
    port.register_interface::<dyn Octet>(-1, base).unwrap();
    for tag in ["middle", "top"] {
        let layer = TaggingLayer::new(tag, &log);
        let previous = port
            .interpose_interface::<dyn Octet>(-1, Arc::clone(&layer) as Arc<dyn Octet>)
            .unwrap();
        *layer.lower.lock().unwrap() = Some(previous);
    }

    let user = manager.create_user();
    manager.connect_device(&user, "layers", 0).unwrap();

    let top = manager.find_interface::<dyn Octet>(&user, true).unwrap();
    assert_eq!(top.depth(), 2);
    top.write(&user, b"x").unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["top", "middle", "base"]);

    log.lock().unwrap().clear();
    let base = manager.find_interface::<dyn Octet>(&user, false).unwrap();
    assert_eq!(base.depth(), 0);
    base.write(&user, b"x").unwrap();
    assert_eq!(*log.lock().unwrap(), vec!["base"]);
}

#[test]
fn test_find_interface_returns_registered_object() {
    let manager = AsynManager::default();
    let port = manager.register_port("find", PortConfig::new(PortAttributes::NONE)).unwrap();
    let driver: Arc<dyn Common> = Arc::new(NullDriver { port: port.clone() });
    port.register_interface::<dyn Common>(-1, Arc::clone(&driver)).unwrap();
    assert_eq!(
        port.register_interface::<dyn Common>(-1, Arc::clone(&driver)).err(),
        Some(AsynError::AlreadyRegistered)
    );

    let user = manager.create_user();
    manager.connect_device(&user, "find", 0).unwrap();
    let found = manager.find_interface::<dyn Common>(&user, true).unwrap();
    assert!(Arc::ptr_eq(found.methods(), &driver));
    assert_eq!(
        manager.find_interface::<dyn Octet>(&user, true).err(),
        Some(AsynError::NotFound)
    );
    assert!(user.error_message().contains("asynOctet"));
}

#[test]
fn test_lock_times_out_while_held_elsewhere() {
    let (manager, _driver) = echo_manager("locked", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let holder = connected_user(&manager, "locked");
    let waiter = connected_user(&manager, "locked");
    let (locked_tx, locked_rx) = mpsc::channel();

    thread::scope(|s| {
        s.spawn(|| {
            manager.lock(&holder, Duration::from_millis(100)).unwrap();
            locked_tx.send(()).unwrap();
            thread::sleep(Duration::from_secs(1));
            manager.unlock(&holder).unwrap();
        });
        locked_rx.recv().unwrap();

        let start = Instant::now();
        assert_eq!(manager.lock(&waiter, Duration::from_millis(300)), Err(AsynError::Timeout));
        let waited = start.elapsed();
        assert!(waited >= Duration::from_millis(300), "returned early: {:?}", waited);
        assert!(waited < Duration::from_secs(1), "waited for the holder: {:?}", waited);
    });

    manager.lock(&waiter, Duration::from_millis(100)).unwrap();
    manager.unlock(&waiter).unwrap();
}

#[test]
fn test_autoconnect_retries_until_connected() {
    let (manager, driver) = echo_manager(
        "retry",
        PortAttributes::CAN_BLOCK,
        EchoOptions {
            fail_connects: 2,
            ..Default::default()
        },
    );
    let user = manager.create_user();
    manager.connect_device(&user, "retry", 0).unwrap();
    assert_eq!(manager.is_connected(&user), Ok(false));

    manager.wait_connect(&user, Duration::from_secs(2)).unwrap();
    assert_eq!(driver.connect_attempts(), 3);
    assert_eq!(manager.is_connected(&user), Ok(true));

    // A dropped link reconnects on its own
    driver.drop_link(0).unwrap();
    manager.wait_connect(&user, Duration::from_secs(2)).unwrap();
    assert_eq!(driver.connect_attempts(), 4);
}

#[test]
fn test_exception_callbacks() {
    let (manager, _driver) = echo_manager("exc", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let user = manager.create_user();
    manager.connect_device(&user, "exc", 0).unwrap();
    let (tx, rx) = mpsc::channel();
    let handle = manager
        .exception_callback_add(&user, move |_, exception| tx.send(exception).unwrap())
        .unwrap();

    // Announced from the worker thread after the state change
    manager.wait_connect(&user, Duration::from_secs(2)).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(1)), Ok(Exception::Connect));

    manager.enable(&user, false).unwrap();
    assert_eq!(manager.is_enabled(&user), Ok(false));
    assert_eq!(
        manager.queue_request(&user, Priority::Low, Request::new(|_| ())),
        Err(AsynError::Disabled)
    );
    manager.enable(&user, true).unwrap();
    manager.auto_connect(&user, false).unwrap();
    assert_eq!(manager.is_auto_connect(&user), Ok(false));

    manager.exception_callback_remove(&handle).unwrap();
    manager.enable(&user, false).unwrap();
    assert_eq!(
        rx.try_iter().collect::<Vec<_>>(),
        vec![Exception::Enable, Exception::Enable, Exception::AutoConnect]
    );
    assert_eq!(manager.exception_callback_remove(&handle), Err(AsynError::NotFound));
}

#[test]
fn test_shutdown_notifies_and_rejects() {
    let (manager, _driver) = echo_manager("down", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let user = connected_user(&manager, "down");
    let (tx, rx) = mpsc::channel();
    manager
        .exception_callback_add(&user, move |_, exception| {
            let _ = tx.send(exception);
        })
        .unwrap();

    manager.shutdown_port("down").unwrap();
    let seen: Vec<Exception> = rx.try_iter().collect();
    assert_eq!(seen.last(), Some(&Exception::Shutdown));
    assert_eq!(
        manager.queue_request(&user, Priority::Low, Request::new(|_| ())),
        Err(AsynError::Disabled)
    );
}

#[test]
fn test_eos_layer_over_echo() {
    let (manager, driver) = echo_manager("eos", PortAttributes::NONE, EchoOptions::default());
    EosInterpose::install(driver.port(), 0).unwrap();
    let user = connected_user(&manager, "eos");
    let octet = manager.find_interface::<dyn Octet>(&user, true).unwrap();
    octet.set_output_eos(&user, b"\r\n").unwrap();
    octet.set_input_eos(&user, b"\r\n").unwrap();

    octet.write(&user, b"one").unwrap();
    octet.write(&user, b"two").unwrap();
    let mut buf = [0u8; 16];
    assert_eq!(octet.read(&user, &mut buf), Ok((3, EomReason::EOS)));
    assert_eq!(&buf[..3], b"one");
    assert_eq!(octet.read(&user, &mut buf), Ok((3, EomReason::EOS)));
    assert_eq!(&buf[..3], b"two");
    assert_eq!(octet.input_eos(&user), Ok(b"\r\n".to_vec()));
}

#[test]
fn test_report_lists_ports() {
    let (manager, _driver) = echo_manager("rep", PortAttributes::CAN_BLOCK, EchoOptions::default());
    let _user = connected_user(&manager, "rep");
    let mut text = String::new();
    manager.report(&mut text, 1, None).unwrap();
    println!("{}", text);
    assert!(text.contains("rep"));
    assert!(text.contains("asynOctet"));
    assert!(text.contains("echo delay"));
}

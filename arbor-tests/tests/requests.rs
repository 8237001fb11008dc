//! Unary request handling: server-wide and container-scoped operations,
//! grace-timer behavior and destroy semantics, exercised through a real
//! client/server pair over a unix socket.

use arbor_client::{
    BandwidthLimits, BindMount, BindMountMode, BindMountOrigin, Capacity, ContainerInfo,
    ContainerSpec, CpuLimits, DiskLimits, MemoryLimits, PortMapping, Properties, Protocol,
};
use arbor_tests::{
    eventually,
    fake::{FakeBackend, FakeContainer},
    TestServer,
};
use std::time::{Duration, Instant};
use tokio::time;

fn properties(pairs: &[(&str, &str)]) -> Properties {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

#[tokio::test]
async fn ping() {
    let server = TestServer::start_default().await;
    let client = server.client();

    client.ping().await.expect("ping failed");

    server.backend.fail("ping", "oh no!");
    let err = client.ping().await.expect_err("ping succeeded");
    assert!(err.to_string().contains("oh no!"));
}

#[tokio::test]
async fn ping_fails_when_the_server_is_down() {
    let mut server = TestServer::start_default().await;
    let client = server.client();
    server.stop().await;

    assert!(client.ping().await.is_err());
}

#[tokio::test]
async fn capacity() {
    let server = TestServer::start_default().await;
    *server.backend.capacity.lock().unwrap() = Capacity {
        memory_in_bytes: 1111,
        disk_in_bytes: 2222,
        max_containers: 42,
    };

    let capacity = server.client().capacity().await.expect("capacity failed");
    assert_eq!(capacity.memory_in_bytes, 1111);
    assert_eq!(capacity.disk_in_bytes, 2222);
    assert_eq!(capacity.max_containers, 42);

    server.backend.fail("capacity", "oh no!");
    assert!(server.client().capacity().await.is_err());
}

#[tokio::test]
async fn create_returns_the_created_handle() {
    let server = TestServer::start_default().await;
    server.backend.install(FakeContainer::new("some-handle"));

    let container = server
        .client()
        .create(ContainerSpec {
            handle: "some-handle".to_string(),
            ..Default::default()
        })
        .await
        .expect("create failed");

    assert_eq!(container.handle(), "some-handle");
}

#[tokio::test]
async fn create_passes_the_spec_verbatim_to_the_backend() {
    let server = TestServer::start_default().await;
    server.backend.install(FakeContainer::new("some-handle"));

    let spec = ContainerSpec {
        handle: "some-handle".to_string(),
        grace_time: Duration::from_secs(42),
        network: "some-network".to_string(),
        rootfs: "/path/to/rootfs".to_string(),
        bind_mounts: vec![BindMount {
            src_path: "/bind/mount/src".to_string(),
            dst_path: "/bind/mount/dst".to_string(),
            mode: BindMountMode::Rw,
            origin: BindMountOrigin::Container,
        }],
        properties: properties(&[("prop-a", "val-a"), ("prop-b", "val-b")]),
        env: vec!["env1=env1Value".to_string(), "env2=env2Value".to_string()],
        privileged: false,
    };

    server.client().create(spec.clone()).await.expect("create failed");

    assert_eq!(*server.backend.created.lock().unwrap(), vec![spec]);
}

#[tokio::test]
async fn unspecified_grace_time_defaults_to_the_servers() {
    let server = TestServer::start(FakeBackend::new(), Duration::from_secs(42)).await;
    server.backend.install(FakeContainer::new("some-handle"));

    server
        .client()
        .create(ContainerSpec {
            handle: "some-handle".to_string(),
            ..Default::default()
        })
        .await
        .expect("create failed");

    let created = server.backend.created.lock().unwrap();
    assert_eq!(created[0].grace_time, Duration::from_secs(42));
}

#[tokio::test]
async fn create_failures_surface() {
    let server = TestServer::start_default().await;
    server.backend.fail("create", "oh no!");

    let err = server
        .client()
        .create(ContainerSpec::default())
        .await
        .expect_err("create succeeded");
    assert!(err.to_string().contains("oh no!"));
}

#[tokio::test]
async fn an_idle_container_is_destroyed_after_its_grace_time() {
    let backend = FakeBackend::new();
    backend.set_grace_time(Duration::from_secs(1));
    backend.install(FakeContainer::new("doomed-handle"));
    let server = TestServer::start(backend, Duration::from_secs(42)).await;

    let before = Instant::now();
    server
        .client()
        .create(ContainerSpec::default())
        .await
        .expect("create failed");

    let destroyed = |server: &TestServer| {
        server
            .backend
            .destroyed
            .lock()
            .unwrap()
            .contains(&"doomed-handle".to_string())
    };

    assert!(eventually(Duration::from_secs(2), || destroyed(&server)).await);
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(1800), "fired after {:?}", elapsed);
}

#[tokio::test]
async fn container_activity_postpones_destruction() {
    let backend = FakeBackend::new();
    backend.set_grace_time(Duration::from_millis(200));
    backend.install(FakeContainer::new("busy-handle"));
    let server = TestServer::start(backend, Duration::from_secs(42)).await;
    let client = server.client();

    let container = client
        .create(ContainerSpec::default())
        .await
        .expect("create failed");

    for _ in 0..11 {
        time::sleep(Duration::from_millis(20)).await;
        container.stop(false).await.expect("stop failed");
    }

    // Every stop reset the timer, so nothing fired during the loop.
    assert!(server.backend.destroyed.lock().unwrap().is_empty());

    let before = Instant::now();
    assert!(
        eventually(Duration::from_secs(1), || {
            !server.backend.destroyed.lock().unwrap().is_empty()
        })
        .await
    );
    let elapsed = before.elapsed();
    assert!(elapsed >= Duration::from_millis(100), "fired after {:?}", elapsed);
    assert!(elapsed < Duration::from_millis(600), "fired after {:?}", elapsed);
    assert_eq!(
        *server.backend.destroyed.lock().unwrap(),
        vec!["busy-handle".to_string()]
    );
}

#[tokio::test]
async fn a_zero_grace_time_disables_the_timer() {
    let backend = FakeBackend::new();
    backend.set_grace_time(Duration::ZERO);
    backend.install(FakeContainer::new("immortal-handle"));
    let server = TestServer::start(backend, Duration::from_secs(42)).await;

    server
        .client()
        .create(ContainerSpec::default())
        .await
        .expect("create failed");

    time::sleep(Duration::from_millis(200)).await;
    assert!(server.backend.destroyed.lock().unwrap().is_empty());
}

#[tokio::test]
async fn destroy() {
    let server = TestServer::start_default().await;

    server
        .client()
        .destroy("some-handle")
        .await
        .expect("destroy failed");

    assert_eq!(
        *server.backend.destroyed.lock().unwrap(),
        vec!["some-handle".to_string()]
    );
}

#[tokio::test]
async fn concurrent_destroys_of_one_handle_collapse_to_one() {
    let server = TestServer::start_default().await;
    *server.backend.destroy_delay.lock().unwrap() = Duration::from_millis(500);

    let first = {
        let client = server.client();
        tokio::spawn(async move { client.destroy("some-handle").await })
    };

    assert!(
        eventually(Duration::from_secs(1), || {
            *server.backend.destroys_started.lock().unwrap() == 1
        })
        .await
    );

    let err = server
        .client()
        .destroy("some-handle")
        .await
        .expect_err("second destroy succeeded");
    assert!(err.to_string().contains("already destroying"));

    first
        .await
        .expect("join failed")
        .expect("first destroy failed");

    assert_eq!(*server.backend.destroys_started.lock().unwrap(), 1);
    assert_eq!(
        *server.backend.destroyed.lock().unwrap(),
        vec!["some-handle".to_string()]
    );
}

#[tokio::test]
async fn a_failed_destroy_can_be_retried() {
    let server = TestServer::start_default().await;
    server.backend.fail("destroy", "oh no!");

    assert!(server.client().destroy("some-handle").await.is_err());

    server.backend.succeed("destroy");
    server
        .client()
        .destroy("some-handle")
        .await
        .expect("retry failed");
    assert_eq!(
        *server.backend.destroyed.lock().unwrap(),
        vec!["some-handle".to_string()]
    );
}

#[tokio::test]
async fn list_returns_the_backends_containers() {
    let server = TestServer::start_default().await;
    *server.backend.containers.lock().unwrap() = vec![
        FakeContainer::new("some-handle"),
        FakeContainer::new("another-handle"),
        FakeContainer::new("super-handle"),
    ];

    let containers = server
        .client()
        .containers(Properties::new())
        .await
        .expect("list failed");
    let handles: Vec<&str> = containers.iter().map(|c| c.handle()).collect();

    assert_eq!(handles.len(), 3);
    assert!(handles.contains(&"some-handle"));
    assert!(handles.contains(&"another-handle"));
    assert!(handles.contains(&"super-handle"));
}

#[tokio::test]
async fn list_forwards_the_property_filter() {
    let server = TestServer::start_default().await;

    let filter = properties(&[("foo", "bar")]);
    server
        .client()
        .containers(filter.clone())
        .await
        .expect("list failed");

    assert_eq!(*server.backend.list_filters.lock().unwrap(), vec![filter]);
}

#[tokio::test]
async fn operations_on_unknown_handles_fail() {
    let server = TestServer::start_default().await;
    let container = server.client().container("some-missing-handle");

    let err = container.stop(true).await.expect_err("stop succeeded");
    assert_eq!(err.to_string(), "unknown handle: some-missing-handle");

    assert!(container.info().await.is_err());
    assert!(container.net_in(123, 456).await.is_err());
    assert!(container.property("some-property").await.is_err());
    assert!(container
        .limit_memory(MemoryLimits { limit_in_bytes: 1 })
        .await
        .is_err());
}

#[tokio::test]
async fn stop_forwards_the_kill_flag() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    let container = server.client().container("some-handle");
    container.stop(true).await.expect("stop failed");

    assert_eq!(*fake.stops.lock().unwrap(), vec![true]);

    fake.fail("stop", "oh no!");
    assert!(container.stop(true).await.is_err());
}

#[tokio::test]
async fn info_reports_the_backends_view() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    let info = ContainerInfo {
        state: "active".to_string(),
        events: vec!["oom".to_string(), "party".to_string()],
        host_ip: "host-ip".to_string(),
        container_ip: "container-ip".to_string(),
        external_ip: "external-ip".to_string(),
        container_path: "/path/to/container".to_string(),
        process_ids: vec![1, 2],
        properties: properties(&[("foo", "bar"), ("a", "b")]),
        mapped_ports: vec![
            PortMapping {
                host_port: 1234,
                container_port: 5678,
            },
            PortMapping {
                host_port: 1235,
                container_port: 5679,
            },
        ],
        ..Default::default()
    };
    *fake.info.lock().unwrap() = info.clone();

    let reported = server
        .client()
        .container("some-handle")
        .info()
        .await
        .expect("info failed");
    assert_eq!(reported, info);

    fake.fail("info", "oh no!");
    assert!(server.client().container("some-handle").info().await.is_err());
}

#[tokio::test]
async fn limits_are_set_and_effective_values_returned() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    let container = server.client().container("some-handle");

    let set = BandwidthLimits {
        rate_in_bytes_per_second: 123,
        burst_rate_in_bytes_per_second: 456,
    };
    let effective = BandwidthLimits {
        rate_in_bytes_per_second: 1230,
        burst_rate_in_bytes_per_second: 4560,
    };
    *fake.current_bandwidth.lock().unwrap() = effective;

    let limits = container
        .limit_bandwidth(set)
        .await
        .expect("limit bandwidth failed");
    assert_eq!(*fake.bandwidth_limits.lock().unwrap(), vec![set]);
    assert_eq!(limits, effective);

    let set = CpuLimits {
        limit_in_shares: 123,
    };
    container.limit_cpu(set).await.expect("limit cpu failed");
    assert_eq!(*fake.cpu_limits.lock().unwrap(), vec![set]);

    let set = DiskLimits {
        block_soft: 111,
        block_hard: 222,
        inode_soft: 333,
        inode_hard: 444,
        byte_soft: 555,
        byte_hard: 666,
    };
    container.limit_disk(set).await.expect("limit disk failed");
    assert_eq!(*fake.disk_limits.lock().unwrap(), vec![set]);

    let set = MemoryLimits {
        limit_in_bytes: 1024,
    };
    container
        .limit_memory(set)
        .await
        .expect("limit memory failed");
    assert_eq!(*fake.memory_limits.lock().unwrap(), vec![set]);
}

#[tokio::test]
async fn current_limits_do_not_change_anything() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    let container = server.client().container("some-handle");

    let effective = MemoryLimits {
        limit_in_bytes: 2048,
    };
    *fake.current_memory.lock().unwrap() = effective;

    let limits = container
        .current_memory_limits()
        .await
        .expect("current memory limits failed");
    assert_eq!(limits, effective);
    assert!(fake.memory_limits.lock().unwrap().is_empty());

    fake.fail("current_memory_limits", "oh no!");
    assert!(container.current_memory_limits().await.is_err());
}

#[tokio::test]
async fn net_in_maps_ports() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    *fake.net_in_result.lock().unwrap() = (111, 222);
    server.backend.install(fake.clone());

    let (host_port, container_port) = server
        .client()
        .container("some-handle")
        .net_in(123, 456)
        .await
        .expect("net in failed");

    assert_eq!(*fake.net_ins.lock().unwrap(), vec![(123, 456)]);
    assert_eq!((host_port, container_port), (111, 222));
}

#[tokio::test]
async fn net_out_with_a_single_port() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    server
        .client()
        .container("some-handle")
        .net_out("1.2.3.4/22", 456, "", Protocol::All)
        .await
        .expect("net out failed");

    assert_eq!(
        *fake.net_outs.lock().unwrap(),
        vec![("1.2.3.4/22".to_string(), 456, String::new(), Protocol::All)]
    );
}

#[tokio::test]
async fn net_out_with_a_port_range() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    server
        .client()
        .container("some-handle")
        .net_out("1.2.3.4/22", 0, "80:81", Protocol::All)
        .await
        .expect("net out failed");

    assert_eq!(
        *fake.net_outs.lock().unwrap(),
        vec![(
            "1.2.3.4/22".to_string(),
            0,
            "80:81".to_string(),
            Protocol::All
        )]
    );
}

#[tokio::test]
async fn net_out_rejects_invalid_port_ranges() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    let container = server.client().container("some-handle");

    for range in [
        "8080-8081",
        "1:2:3",
        ":8081",
        "8080:",
        "x:8081",
        "8080:x",
        "0:8081",
        "8080:0",
        "-8080:8081",
        "8080:-8081",
        "65536:8081",
        "8080:65536",
        "200000000000000000000000000000000000000:8081",
    ] {
        let err = container
            .net_out("foo-network", 0, range, Protocol::All)
            .await
            .expect_err("net out succeeded");
        assert_eq!(err.to_string(), format!("invalid port range: {:?}", range));
    }

    assert!(fake.net_outs.lock().unwrap().is_empty());
}

#[tokio::test]
async fn properties_round_trip() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    let container = server.client().container("some-handle");

    container
        .set_property("some-property", "some-value")
        .await
        .expect("set property failed");
    assert_eq!(
        *fake.property_sets.lock().unwrap(),
        vec![("some-property".to_string(), "some-value".to_string())]
    );

    let value = container
        .property("some-property")
        .await
        .expect("get property failed");
    assert_eq!(value, "some-value");
    assert_eq!(
        *fake.property_gets.lock().unwrap(),
        vec!["some-property".to_string()]
    );

    container
        .remove_property("some-property")
        .await
        .expect("remove property failed");
    assert_eq!(
        *fake.property_removes.lock().unwrap(),
        vec!["some-property".to_string()]
    );

    let err = container
        .property("some-property")
        .await
        .expect_err("get of removed property succeeded");
    assert!(err.to_string().contains("unknown property"));
}

#[tokio::test]
async fn property_failures_surface() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());
    let container = server.client().container("some-handle");

    fake.fail("set_property", "oh no!");
    assert!(container.set_property("k", "v").await.is_err());

    fake.fail("remove_property", "oh no!");
    assert!(container.remove_property("k").await.is_err());
}

#[tokio::test]
async fn kill_signals_a_process_by_id() {
    let server = TestServer::start_default().await;
    let fake = FakeContainer::new("some-handle");
    server.backend.install(fake.clone());

    server
        .client()
        .container("some-handle")
        .kill(42)
        .await
        .expect("kill failed");

    assert_eq!(
        *fake.signals.lock().unwrap(),
        vec![(42, arbor_server::backend::Signal::Kill)]
    );
}

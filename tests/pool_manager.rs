mod common;

use std::time::Duration;

use common::*;
use hasql::{AcquireOptions, PoolConfig, PoolManager};

fn index_of(manager: &PoolManager<TestDriver>, host: &str) -> usize {
    manager
        .dsns()
        .iter()
        .position(|dsn| dsn.host() == host)
        .expect("host should be part of the manager's DSN")
}

#[tokio::test]
async fn discovers_roles() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    assert_eq!(manager.master_pool_count(), 1);
    assert_eq!(manager.replica_pool_count(), 2);
    assert!(manager.pool_is_master(index_of(&manager, "master")));
    assert!(manager.pool_is_replica(index_of(&manager, "replica1")));
    assert!(manager.pool_is_replica(index_of(&manager, "replica2")));
    manager.close().await;
}

#[tokio::test]
async fn ready_waits_for_every_host() {
    let manager = test_manager(TEST_DSN, TestDriver::new());
    manager.ready(None, None, None).await.unwrap();
    assert_eq!(manager.dsns().len(), manager.available_pool_count());
    manager.close().await;
}

#[tokio::test]
async fn ready_with_counts() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    driver.pool("master").shutdown();
    driver.pool("replica1").shutdown();
    driver.pool("replica2").shutdown();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 0);
    assert_eq!(manager.replica_pool_count(), 0);

    driver.pool("master").startup();
    driver.pool("master").set_master(true);
    manager.ready(Some(1), Some(0), None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 1);
    assert_eq!(manager.replica_pool_count(), 0);
    manager.close().await;
}

#[tokio::test]
async fn ready_rejects_mismatched_counts() {
    let manager = test_manager(TEST_DSN, TestDriver::new());
    for (masters, replicas) in [(Some(1), None), (None, Some(2))] {
        let error = manager.ready(masters, replicas, None).await.unwrap_err();
        assert!(error.is_invalid_argument(), "{error}");
    }
    manager.close().await;
}

#[tokio::test]
async fn wait_next_pool_check_observes_a_full_cycle() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    driver.pool("master").shutdown();
    assert_eq!(manager.master_pool_count(), 1);
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 0);
    manager.close().await;
}

#[tokio::test]
async fn restarted_master_comes_back_as_replica() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    let master = driver.pool("master");
    let master_slot = index_of(&manager, "master");

    master.shutdown();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 0);

    master.startup();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 0);
    assert!(manager.pool_is_replica(master_slot));
    manager.close().await;
}

#[tokio::test]
async fn replica_shutdown_shrinks_the_replica_set() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    assert_eq!(manager.replica_pool_count(), 2);

    driver.pool("replica1").shutdown();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.replica_pool_count(), 1);
    manager.close().await;
}

#[tokio::test]
async fn failover_moves_roles_and_keeps_sets_disjoint() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    let master_slot = index_of(&manager, "master");
    let replica_slot = index_of(&manager, "replica1");

    driver.pool("master").set_master(false);
    driver.pool("replica1").set_master(true);
    manager.wait_next_pool_check(None).await.unwrap();

    assert!(manager.pool_is_master(replica_slot));
    assert!(manager.pool_is_replica(master_slot));
    for index in 0..manager.dsns().len() {
        assert!(
            !(manager.pool_is_master(index) && manager.pool_is_replica(index)),
            "host {index} is in both sets"
        );
    }
    manager.close().await;
}

#[tokio::test]
async fn acquire_and_release_track_the_borrowed_connection() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    let master = driver.pool("master");
    // the pool is idle once the probe connection is returned between cycles
    let idle_size = master.max_size();
    assert!(wait_until(|| master.free_size() == idle_size).await);

    let connection = manager.acquire_master().await.unwrap();
    assert!(master.used_contains(connection.id()));
    assert_eq!(manager.borrowed_connection_count(), 1);
    assert!(wait_until(|| master.free_size() == idle_size - 1).await);

    let id = connection.id();
    manager.release(connection).await.unwrap();
    assert!(!master.used_contains(id));
    assert_eq!(manager.borrowed_connection_count(), 0);
    assert!(wait_until(|| master.free_size() == idle_size).await);
    manager.close().await;
}

#[tokio::test]
async fn dropped_connection_is_released_in_the_background() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    let master = driver.pool("master");

    let id = {
        let connection = manager.acquire_master().await.unwrap();
        assert!(master.used_contains(connection.id()));
        connection.id()
    };
    assert!(wait_until(|| !master.used_contains(id)).await);
    assert!(wait_until(|| master.free_size() == master.max_size()).await);
    assert_eq!(manager.borrowed_connection_count(), 0);
    manager.close().await;
}

#[tokio::test]
async fn concurrent_acquires_hand_out_distinct_connections() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    let acquired = futures::future::join_all((0..5).map(|_| manager.acquire_master())).await;
    let connections: Vec<_> = acquired.into_iter().map(|c| c.unwrap()).collect();
    let mut ids: Vec<u64> = connections.iter().map(|c| c.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert_eq!(manager.borrowed_connection_count(), 5);

    for connection in connections {
        manager.release(connection).await.unwrap();
    }
    assert_eq!(manager.borrowed_connection_count(), 0);
    manager.close().await;
}

#[tokio::test]
async fn read_only_acquire_falls_back_to_the_master() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    let master = driver.pool("master");

    driver.pool("replica1").shutdown();
    driver.pool("replica2").shutdown();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.replica_pool_count(), 0);

    let connection = manager
        .acquire_replica(AcquireOptions::default().fallback_master(true))
        .await
        .unwrap();
    assert!(master.used_contains(connection.id()));
    manager.release(connection).await.unwrap();
    manager.close().await;
}

#[tokio::test]
async fn read_only_acquire_without_fallback_times_out() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    driver.pool("replica1").shutdown();
    driver.pool("replica2").shutdown();
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.replica_pool_count(), 0);

    let error = manager
        .acquire_replica(
            AcquireOptions::default()
                .fallback_master(false)
                .timeout(Duration::from_millis(300)),
        )
        .await
        .unwrap_err();
    assert!(error.is_timeout(), "{error}");
    manager.close().await;
}

#[tokio::test]
async fn host_behind_firewall_is_dropped_and_recovered() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 1);
    let master = driver.pool("master");

    master.behind_firewall(true);
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 0);

    master.behind_firewall(false);
    manager.wait_next_pool_check(None).await.unwrap();
    assert_eq!(manager.master_pool_count(), 1);
    manager.close().await;
}

#[tokio::test]
async fn firewalled_replicas_leave_and_rejoin_one_by_one() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    assert_eq!(manager.replica_pool_count(), 2);

    for host in ["replica1", "replica2"] {
        let replica = driver.pool(host);
        replica.behind_firewall(true);
        manager.wait_next_pool_check(None).await.unwrap();
        assert_eq!(manager.replica_pool_count(), 1);
        replica.behind_firewall(false);
        manager.wait_next_pool_check(None).await.unwrap();
        assert_eq!(manager.replica_pool_count(), 2);
    }
    manager.close().await;
}

#[tokio::test]
async fn close_clears_sets_and_closes_every_pool() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();
    assert!(manager.master_pool_count() > 0);
    assert!(manager.replica_pool_count() > 0);

    manager.close().await;
    assert!(manager.closed());
    assert_eq!(manager.master_pool_count(), 0);
    assert_eq!(manager.replica_pool_count(), 0);
    for pool in driver.pools() {
        assert_eq!(pool.close_calls(), 1, "pool {}", pool.host());
        assert!(pool.all_connections_closed(), "pool {}", pool.host());
    }

    // closing again is harmless
    manager.close().await;
    assert!(manager.closed());
}

#[tokio::test]
async fn terminate_uses_the_forced_shutdown_path() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    manager.terminate().await;
    assert!(manager.closed());
    assert_eq!(manager.master_pool_count(), 0);
    assert_eq!(manager.replica_pool_count(), 0);
    for pool in driver.pools() {
        assert_eq!(pool.terminate_calls(), 1, "pool {}", pool.host());
        assert_eq!(pool.close_calls(), 0, "pool {}", pool.host());
        assert!(pool.all_connections_closed(), "pool {}", pool.host());
    }
}

#[tokio::test]
async fn releasing_after_close_is_a_programming_error() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    let connection = manager.acquire_master().await.unwrap();
    manager.close().await;
    assert_eq!(manager.borrowed_connection_count(), 0);

    let error = manager.release(connection).await.unwrap_err();
    assert!(error.is_invalid_argument(), "{error}");
}

#[tokio::test]
async fn one_pool_slot_is_reserved_for_the_probe_connection() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    // the driver adds one slot on top of the requested capacity
    assert_eq!(
        driver.pool("master").max_size(),
        PoolConfig::default().max_size + 1
    );
    manager.close().await;
}

#[tokio::test]
async fn probe_durations_feed_the_stopwatch() {
    let driver = TestDriver::new();
    let manager = test_manager(TEST_DSN, driver.clone());
    manager.ready(None, None, None).await.unwrap();

    let master_slot = master_index(&manager).unwrap();
    assert!(manager.last_response_time(master_slot).is_some());
    manager.close().await;
}

#[tokio::test]
async fn weight_is_rejected_for_write_acquires() {
    let manager = test_manager(TEST_DSN, TestDriver::new());
    let error = manager
        .acquire(AcquireOptions::default().master_as_replica_weight(0.5))
        .await
        .unwrap_err();
    assert!(error.is_invalid_argument(), "{error}");

    let error = manager
        .acquire_replica(AcquireOptions::default().master_as_replica_weight(1.5))
        .await
        .unwrap_err();
    assert!(error.is_invalid_argument(), "{error}");
    manager.close().await;
}

#[tokio::test]
async fn manager_rejects_invalid_configuration() {
    let mut options = test_options();
    options.master_as_replica_weight = 2.0;
    assert!(PoolManager::new(TEST_DSN, TestDriver::new(), options).is_err());

    assert!(PoolManager::new("postgresql://", TestDriver::new(), test_options()).is_err());
}

//! Array discovery and lifecycle against the virtual FPS.

mod common;

use std::time::Duration;

use anyhow::Result;
use fps_controller::positioner::PositionerState;

use common::{test_config, virtual_array};

#[tokio::test]
async fn initialise_discovers_the_folded_array() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1, 2, 3], test_config());
    fps.initialise(false).await?;

    assert_eq!(fps.len(), 3);
    assert_eq!(fps.positioner_ids(), vec![1, 2, 3]);

    for positioner in fps.positioners() {
        assert_eq!(positioner.firmware().as_deref(), Some("10.11.12"));
        assert_eq!(positioner.position(), (0.0, 180.0));
        assert_eq!(positioner.speed(), (2000, 2000));
        assert_eq!(positioner.state(), PositionerState::Ready);
    }
    assert!(fps.is_folded());

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn initialise_with_no_devices_finds_nothing() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[], test_config());
    fps.initialise(false).await?;
    assert!(fps.is_empty());
    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pollers_start_and_stop_with_the_controller() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1], test_config());
    fps.initialise(true).await?;

    assert!(fps.pollers.status.running());
    assert!(fps.pollers.position.running());

    fps.pollers.stop().await;
    assert!(!fps.pollers.status.running());
    assert!(!fps.pollers.position.running());

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn pollers_track_device_side_changes() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1], test_config());
    fps.initialise(true).await?;

    vfps.set_position(1, 90.0, 170.0);
    fps.pollers.set_delay(Duration::from_millis(20), true);
    tokio::time::sleep(Duration::from_millis(150)).await;

    let (alpha, beta) = fps.positioner(1)?.position();
    assert!((alpha - 90.0).abs() < 1e-3);
    assert!((beta - 170.0).abs() < 1e-3);

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn update_position_refreshes_on_demand() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    vfps.set_position(1, 12.0, 175.0);
    fps.update_position().await?;
    let (alpha, beta) = fps.positioner(1)?.position();
    assert!((alpha - 12.0).abs() < 1e-3);
    assert!((beta - 175.0).abs() < 1e-3);
    assert!(!fps.is_folded());

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn bootloader_firmware_is_recognised() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1, 2], test_config());
    fps.initialise(false).await?;

    vfps.set_bootloader(1);
    for positioner in fps.positioners() {
        positioner.update_firmware_version().await?;
    }

    let one = fps.positioner(1)?;
    assert!(one.is_bootloader());
    assert_eq!(one.firmware().as_deref(), Some("10.80.12"));
    assert_eq!(one.state(), PositionerState::Bootloader);
    assert!(!fps.positioner(2)?.is_bootloader());

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn shutdown_is_idempotent_enough() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1], test_config());
    fps.initialise(true).await?;
    fps.shutdown().await?;
    assert!(!fps.pollers.running());
    Ok(())
}

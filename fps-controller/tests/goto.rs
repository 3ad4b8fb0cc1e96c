//! Direct goto moves against the virtual FPS.

mod common;

use anyhow::Result;
use fps_controller::positioner::GotoParams;
use fps_controller::{FpsError, SafeMode};
use fps_types::PositionerStatus;

use common::{test_config, virtual_array};

#[tokio::test]
async fn goto_moves_within_bounds() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    let positioner = fps.positioner(1)?;
    positioner.goto(GotoParams::absolute(359.999, 0.0)).await?;

    let (alpha, beta) = positioner.position();
    assert!((alpha - 359.999).abs() < 1e-2);
    assert!(beta.abs() < 1e-2);
    let (device_alpha, device_beta) = vfps.position(1).unwrap();
    assert!((device_alpha - 359.999).abs() < 1e-2);
    assert!(device_beta.abs() < 1e-2);

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn goto_rejects_the_closed_bound() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    let err = fps.positioner(1)?.goto(GotoParams::absolute(360.0, 0.0)).await;
    assert!(matches!(err, Err(FpsError::Validation(_))));

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn goto_relative_offsets_from_current() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    let positioner = fps.positioner(1)?;
    positioner.goto(GotoParams::relative(1.0, -1.0)).await?;
    let (alpha, beta) = positioner.position();
    assert!((alpha - 1.0).abs() < 1e-2);
    assert!((beta - 179.0).abs() < 1e-2);

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn goto_with_speed_override() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    let positioner = fps.positioner(1)?;
    positioner
        .goto(GotoParams { alpha: 10.0, beta: 175.0, speed: Some((500, 1500)), relative: false })
        .await?;
    assert_eq!(positioner.speed(), (500, 1500));

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn safe_mode_floors_beta() -> Result<()> {
    let mut config = test_config();
    config.safe_mode = SafeMode::On { min_beta: 170.0 };
    let (fps, _vfps) = virtual_array(&[1], config);
    fps.initialise(false).await?;

    let positioner = fps.positioner(1)?;
    match positioner.goto(GotoParams::absolute(100.0, 169.0)).await {
        Err(FpsError::Validation(msg)) => assert!(msg.contains("safe mode")),
        other => panic!("unexpected: {other:?}"),
    }
    // At the floor itself the move is allowed.
    positioner.goto(GotoParams::absolute(100.0, 170.0)).await?;

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn collision_bit_fails_the_move() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    vfps.or_status(1, PositionerStatus::COLLISION_BETA);
    match fps.positioner(1)?.goto(GotoParams::absolute(90.0, 170.0)).await {
        Err(FpsError::Collision { positioner_id: 1, status }) => assert!(status.collided()),
        other => panic!("unexpected: {other:?}"),
    }

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn home_reestablishes_the_datums() -> Result<()> {
    let (fps, vfps) = virtual_array(&[1], test_config());
    fps.initialise(false).await?;

    vfps.set_position(1, 45.0, 200.0);
    fps.update_position().await?;

    fps.positioner(1)?.home().await?;
    assert_eq!(fps.positioner(1)?.position(), (0.0, 0.0));
    assert_eq!(vfps.position(1).unwrap(), (0.0, 0.0));

    fps.shutdown().await?;
    Ok(())
}

#[tokio::test]
async fn array_goto_moves_several_positioners() -> Result<()> {
    let (fps, _vfps) = virtual_array(&[1, 2, 3], test_config());
    fps.initialise(false).await?;

    let targets = [(1u16, (10.0, 175.0)), (2, (20.0, 178.0)), (3, (30.0, 179.0))]
        .into_iter()
        .collect();
    fps.goto(targets, false).await?;

    for (pid, alpha_want) in [(1u16, 10.0), (2, 20.0), (3, 30.0)] {
        let (alpha, _) = fps.positioner(pid)?.position();
        assert!((alpha - alpha_want).abs() < 1e-2);
    }

    fps.shutdown().await?;
    Ok(())
}

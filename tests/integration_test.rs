use chrono::{TimeZone, Utc};
use std::sync::Arc;
use stvid_acquire::camera::{Cv2Adapter, DriverAdapter, SimulatedVideoCapture};
use stvid_acquire::config::{CameraType, Config, EndPolicy};
use stvid_acquire::session::{CaptureSessionController, SessionState, StackHeader};
use stvid_acquire::twilight::{CapturePlan, TwilightWindowCalculator};
use stvid_acquire::util::{AbortResult, AbortSignal};
#[macro_use]
extern crate assert_float_eq;

fn load_config() -> Config {
    Config::load("tests/test_config.ini").unwrap()
}

#[test]
fn test_load_config() {
    let config = load_config();
    assert_eq!(config.camera.camera_type(), CameraType::Cv2);
    assert_eq!(config.camera.nframes(), 5);
    assert_eq!(config.control.end_policy, EndPolicy::Quota);
    assert_float_absolute_eq!(config.observer.latitude, 52.8344);
    assert_eq!(config.credentials.password(), "secret");
}

#[test]
fn test_plan_tonight() {
    let config = load_config();
    let calculator = TwilightWindowCalculator::new(&config.observer, config.control.twilight);

    let noon = Utc.with_ymd_and_hms(2024, 9, 22, 12, 0, 0).unwrap();
    let plan = calculator.plan(noon).unwrap();

    assert!(plan.start > noon);
    assert!(plan.start < plan.end);
    assert!(plan.end - plan.start > chrono::Duration::hours(9));
    assert!(plan.end - plan.start < chrono::Duration::hours(12));
    assert_float_absolute_eq!(calculator.sun_altitude(plan.start), -6., 0.01);
    assert_float_absolute_eq!(calculator.sun_altitude(plan.end), -6., 0.01);
}

#[tokio::test]
async fn test_quota_session_writes_stack() {
    let config = Arc::new(load_config());
    let dir = tempfile::tempdir().unwrap();
    let sim = SimulatedVideoCapture::new(0);
    let probe = sim.probe();
    let driver = DriverAdapter::Cv2(Cv2Adapter::new(Box::new(sim)));

    let controller = CaptureSessionController::new(config, dir.path());
    controller.arm().unwrap();
    let outcome = controller
        .run(CapturePlan::test_run(Utc::now()), driver, AbortSignal::never())
        .await
        .unwrap();

    let report = match outcome {
        AbortResult::Completed(report) => report,
        AbortResult::Aborted(_) => panic!("Session should not have been aborted"),
    };
    assert_eq!(report.frames_captured, 5);
    assert_eq!(report.stacks_written, 1);
    assert_eq!(controller.state(), SessionState::Idle);
    assert!(!probe.is_open());

    let header_path = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|e| e.unwrap().path())
        .find(|p| p.extension().map_or(false, |x| x == "toml"))
        .unwrap();
    let header: StackHeader = confy::load_path(&header_path).unwrap();
    assert_eq!(header.nframes, 5);
    assert_eq!((header.width, header.height), (16, 12));
    assert_eq!(header.cospar, "4171");

    let data_path = header_path.with_extension("bin");
    assert_eq!(
        std::fs::metadata(data_path).unwrap().len(),
        4 * 4 * 16 * 12
    );
}

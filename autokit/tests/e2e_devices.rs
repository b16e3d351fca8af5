
use std::sync::Arc;
use std::time::Duration;

use autokit::{
    Error, Stage, TestBot,
    devices::{DeviceInteractor, DeviceKind},
};
use autokit_hotplug::{Event, ScanError};
use e2e_common::*;
use futures::StreamExt;

#[tokio::test]
async fn raspberry_pi_flash_and_power_on() {
    let img = create_test_image(4096 + 100);
    let sd = fake_device();
    let sd_path = std::fs::canonicalize(sd.path()).unwrap();

    let log = Log::default();
    let bot = TestBot::new(MockTester::new(log.clone(), sd.path()))
        .with_drive_source(Arc::new(StaticDrives(vec![block_node(
            &sd_path,
            "Generic Ultra HS-SD/MMC",
        )])))
        .with_timings(fast_bot());
    let watchers = ScriptedWatchers::new(Vec::new());
    let dev = DeviceInteractor::new(DeviceKind::RaspberryPi, &bot, &watchers)
        .with_timings(fast_timings());

    bot.setup().await.unwrap();
    dev.power_off().await.unwrap();

    let (tx, rx) = futures::channel::mpsc::channel(20);
    dev.flash_from_file(img.path(), Some(tx)).await.unwrap();
    dev.power_on().await.unwrap();

    assert_flashed(img.path(), sd.path());

    let statuses: Vec<_> = rx.collect().await;
    assert!(
        statuses
            .iter()
            .any(|x| matches!(x, autokit::Status::Flashing(_)))
    );
    assert!(
        statuses
            .iter()
            .any(|x| matches!(x, autokit::Status::Verifying(_)))
    );

    assert_eq!(
        log.take(),
        [
            Call::Setup,
            Call::CloseSerial,
            Call::PowerOff,
            Call::SdToHost,
            Call::SetVout(5.0),
            Call::SdToDut,
            Call::PowerOn,
        ]
    );
}

#[tokio::test]
async fn xz_image_is_decompressed() {
    use std::io::{Read, Write};

    let raw: Vec<u8> = (0..8192u32).map(|x| (x % 251) as u8).collect();
    let mut compressed = Vec::new();
    liblzma::read::XzEncoder::new(raw.as_slice(), 6)
        .read_to_end(&mut compressed)
        .unwrap();
    let mut img = tempfile::NamedTempFile::new().unwrap();
    img.write_all(&compressed).unwrap();

    let sd = fake_device();
    let sd_path = std::fs::canonicalize(sd.path()).unwrap();
    let bot = TestBot::new(MockTester::new(Log::default(), sd.path()))
        .with_drive_source(Arc::new(StaticDrives(vec![block_node(&sd_path, "SD")])))
        .with_timings(fast_bot());
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::RaspberryPi, &bot, &watchers)
        .flash_from_file(img.path(), None)
        .await
        .unwrap();

    let written = std::fs::read(sd.path()).unwrap();
    assert_eq!(written, raw);
}

#[tokio::test]
async fn gz_image_is_decompressed() {
    use std::io::Write;

    let raw: Vec<u8> = (0..8192u32).map(|x| (x % 241) as u8).collect();
    let mut enc = flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
    enc.write_all(&raw).unwrap();
    let mut img = tempfile::NamedTempFile::new().unwrap();
    img.write_all(&enc.finish().unwrap()).unwrap();

    let sd = fake_device();
    let sd_path = std::fs::canonicalize(sd.path()).unwrap();
    let bot = TestBot::new(MockTester::new(Log::default(), sd.path()))
        .with_drive_source(Arc::new(StaticDrives(vec![block_node(&sd_path, "SD")])))
        .with_timings(fast_bot());
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::RaspberryPi, &bot, &watchers)
        .flash_from_file(img.path(), None)
        .await
        .unwrap();

    assert_eq!(std::fs::read(sd.path()).unwrap(), raw);
}

#[tokio::test]
async fn usb_boot_loads_second_stage() {
    let img = create_test_image(2048);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let loader = RecordingLoader::new(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![vec![
        Event::Attach(raw_node()),
        Event::Detach(raw_node()),
        Event::Attach(compute_module(dst.path())),
    ]]);
    let dev = DeviceInteractor::new(DeviceKind::UsbBoot, &bot, &watchers)
        .with_usb(&usb)
        .with_boot_loader(&loader)
        .with_timings(fast_timings());

    dev.flash_from_file(img.path(), None).await.unwrap();

    assert_flashed(img.path(), dst.path());
    assert_eq!(
        log.take(),
        [
            Call::Usb(false),
            Call::PowerOff,
            Call::Usb(false),
            Call::Usb(true),
            Call::BootLoad,
            Call::Usb(false),
            Call::CloseSerial,
            Call::PowerOff,
        ]
    );
}

#[tokio::test]
async fn usb_boot_sequence_holds_flash_slot() {
    let img = create_test_image(2048);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let (loader, release) = RecordingLoader::new(log.clone()).gated();
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![vec![
        Event::Attach(raw_node()),
        Event::Detach(raw_node()),
        Event::Attach(compute_module(dst.path())),
    ]]);
    let dev = DeviceInteractor::new(DeviceKind::UsbBoot, &bot, &watchers)
        .with_usb(&usb)
        .with_boot_loader(&loader)
        .with_timings(fast_timings());

    let flash = dev.flash_from_file(img.path(), None);
    let others = async {
        // Between the power cycle and the image write.
        loader.entered.notified().await;
        assert!(bot.is_flashing());

        let other = create_test_image(512);
        let write = bot
            .flash_to(
                dst.path(),
                &autokit::LocalImage::new(other.path().into()),
                None,
            )
            .await;
        let power = dev.power_on().await;
        let internal = dev.wait_internal_flash().await;

        release.notify_one();
        (write, power, internal)
    };

    let (res, (write, power, internal)) = tokio::join!(flash, others);
    res.unwrap();
    assert!(matches!(write, Err(Error::FlashInProgress)), "{write:?}");
    assert!(matches!(power, Err(Error::FlashInProgress)), "{power:?}");
    assert!(matches!(internal, Err(Error::FlashInProgress)), "{internal:?}");

    assert!(!bot.is_flashing());
    assert_flashed(img.path(), dst.path());
    assert_eq!(log.count(&Call::PowerOn), 0);
}

#[tokio::test]
async fn usb_boot_retries_after_block_attach_timeout() {
    let img = create_test_image(2048);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![
        vec![Event::Attach(raw_node()), Event::Detach(raw_node())],
        vec![
            Event::Attach(raw_node()),
            Event::Detach(raw_node()),
            Event::Attach(compute_module(dst.path())),
        ],
    ]);
    let dev = DeviceInteractor::new(DeviceKind::UsbBoot, &bot, &watchers)
        .with_usb(&usb)
        .with_timings(fast_timings());

    dev.flash_from_file(img.path(), None).await.unwrap();

    assert_flashed(img.path(), dst.path());
    assert_eq!(watchers.remaining(), 0);
    assert_eq!(
        log.take(),
        [
            // attempt 1, times out waiting for the block device
            Call::Usb(false),
            Call::PowerOff,
            Call::Usb(false),
            Call::Usb(true),
            // attempt 2
            Call::Usb(false),
            Call::PowerOff,
            Call::Usb(false),
            Call::Usb(true),
            // cleanup
            Call::Usb(false),
            Call::CloseSerial,
            Call::PowerOff,
        ]
    );
}

#[tokio::test]
async fn usb_boot_gives_up_after_three_attempts() {
    let img = create_test_image(1024);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![
        vec![Event::Attach(raw_node()), Event::Detach(raw_node())];
        4
    ]);
    let dev = DeviceInteractor::new(DeviceKind::BalenaFin, &bot, &watchers)
        .with_usb(&usb)
        .with_timings(fast_timings());

    let err = dev.flash_from_file(img.path(), None).await.unwrap_err();
    assert!(matches!(err, Error::RetriesExhausted { attempts: 3 }), "{err}");

    assert_eq!(watchers.remaining(), 1);
    assert_eq!(log.count(&Call::Usb(true)), 3);

    let calls = log.take();
    assert_eq!(
        calls[calls.len() - 3..],
        [Call::Usb(false), Call::CloseSerial, Call::PowerOff]
    );
    assert!(std::fs::read(dst.path()).unwrap().is_empty());
}

#[tokio::test]
async fn scan_errors_are_not_retried() {
    let img = create_test_image(1024);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![
        vec![Event::Error(ScanError("usb bus gone".to_string()))],
        vec![Event::Attach(raw_node())],
    ]);
    let dev = DeviceInteractor::new(DeviceKind::UsbBoot, &bot, &watchers)
        .with_usb(&usb)
        .with_timings(fast_timings());

    let err = dev.flash_from_file(img.path(), None).await.unwrap_err();
    assert!(matches!(err, Error::Scan(_)), "{err}");
    assert_eq!(watchers.remaining(), 1);
    assert_eq!(log.count(&Call::Usb(true)), 1);

    // Still left powered off.
    let calls = log.take();
    assert_eq!(calls.last(), Some(&Call::PowerOff));
}

#[tokio::test]
async fn fin_v09_powers_the_dut_during_trigger() {
    let img = create_test_image(512);
    let dst = fake_device();

    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(vec![vec![
        Event::Attach(raw_node()),
        Event::Detach(raw_node()),
        Event::Attach(compute_module(dst.path())),
    ]]);
    let dev = DeviceInteractor::new(DeviceKind::BalenaFinV09, &bot, &watchers)
        .with_usb(&usb)
        .with_timings(fast_timings());

    dev.flash_from_file(img.path(), None).await.unwrap();

    assert_eq!(
        log.take(),
        [
            Call::Usb(false),
            Call::PowerOff,
            Call::Usb(false),
            Call::Usb(true),
            Call::SetVout(12.0),
            Call::PowerOn,
            Call::Usb(false),
            Call::CloseSerial,
            Call::PowerOff,
        ]
    );
}

#[tokio::test]
async fn usb_boot_without_port() {
    let img = create_test_image(512);
    let dst = fake_device();

    let log = Log::default();
    let bot = TestBot::new(MockTester::new(log.clone(), dst.path()));
    let watchers = ScriptedWatchers::new(Vec::new());
    let dev = DeviceInteractor::new(DeviceKind::UsbBoot, &bot, &watchers)
        .with_timings(fast_timings());

    let err = dev.flash_from_file(img.path(), None).await.unwrap_err();
    assert!(matches!(err, Error::Config(_)), "{err}");
    assert!(log.take().is_empty());
}

#[tokio::test]
async fn fin_power_on() {
    let log = Log::default();
    let usb = RecordingUsb(log.clone());
    let bot = TestBot::new(MockTester::new(log.clone(), std::path::Path::new("/dev/null")));
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::BalenaFin, &bot, &watchers)
        .with_usb(&usb)
        .with_timings(fast_timings())
        .power_on()
        .await
        .unwrap();

    assert_eq!(
        log.take(),
        [Call::Usb(false), Call::SetVout(12.0), Call::PowerOn]
    );
}

#[tokio::test]
async fn internal_flash_waits_for_idle_current() {
    let log = Log::default();
    let tester = MockTester::new(log.clone(), std::path::Path::new("/dev/null"))
        .with_currents(&[1.2, 0.8, 0.1], 1.0);
    let bot = TestBot::new(tester);
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::BeagleBone, &bot, &watchers)
        .with_timings(fast_timings())
        .wait_internal_flash()
        .await
        .unwrap();

    assert_eq!(
        log.take(),
        [
            Call::CloseSerial,
            Call::PowerOff,
            Call::SetVout(5.0),
            Call::SdToDut,
            Call::PowerOn,
            Call::ReadAmperage,
            Call::ReadAmperage,
            Call::ReadAmperage,
            Call::CloseSerial,
            Call::PowerOff,
            Call::SdToHost,
        ]
    );
}

#[tokio::test]
async fn internal_flash_times_out() {
    let log = Log::default();
    let tester =
        MockTester::new(log.clone(), std::path::Path::new("/dev/null")).with_currents(&[], 0.9);
    let bot = TestBot::new(tester);
    let watchers = ScriptedWatchers::new(Vec::new());

    let timings = autokit::devices::Timings {
        current_poll: Duration::from_millis(5),
        internal_flash_timeout: Duration::from_millis(30),
        ..fast_timings()
    };

    let err = DeviceInteractor::new(DeviceKind::IntelNuc, &bot, &watchers)
        .with_timings(timings)
        .power_on()
        .await
        .unwrap_err();

    assert!(matches!(err, Error::Timeout(Stage::InternalFlash)), "{err}");

    let calls = log.take();
    assert!(calls.iter().filter(|x| **x == Call::ReadAmperage).count() >= 2);
    // Never got to the final power on.
    assert_eq!(calls.iter().filter(|x| **x == Call::PowerOn).count(), 1);
    assert_eq!(calls.last(), Some(&Call::ReadAmperage));
}

#[tokio::test]
async fn intel_nuc_boots_from_internal_storage() {
    let log = Log::default();
    let tester =
        MockTester::new(log.clone(), std::path::Path::new("/dev/null")).with_currents(&[0.05], 0.0);
    let bot = TestBot::new(tester);
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::IntelNuc, &bot, &watchers)
        .with_timings(fast_timings())
        .power_on()
        .await
        .unwrap();

    let calls = log.take();
    assert_eq!(calls[2], Call::SetVout(12.0));
    assert_eq!(calls[calls.len() - 2..], [Call::SdToHost, Call::PowerOn]);
}

#[tokio::test]
async fn beaglebone_flash_sequence() {
    let img = create_test_image(1536);
    let sd = fake_device();
    let sd_path = std::fs::canonicalize(sd.path()).unwrap();

    let log = Log::default();
    let tester = MockTester::new(log.clone(), sd.path()).with_currents(&[0.5], 0.02);
    let bot = TestBot::new(tester)
        .with_drive_source(Arc::new(StaticDrives(vec![block_node(&sd_path, "SD")])))
        .with_timings(fast_bot());
    let watchers = ScriptedWatchers::new(Vec::new());

    DeviceInteractor::new(DeviceKind::BeagleBone, &bot, &watchers)
        .with_timings(fast_timings())
        .flash_from_file(img.path(), None)
        .await
        .unwrap();

    assert_flashed(img.path(), sd.path());
    assert_eq!(
        log.take(),
        [
            Call::CloseSerial,
            Call::PowerOff,
            Call::SdToHost,
            // internal flash
            Call::CloseSerial,
            Call::PowerOff,
            Call::SetVout(5.0),
            Call::SdToDut,
            Call::PowerOn,
            Call::ReadAmperage,
            Call::ReadAmperage,
            Call::CloseSerial,
            Call::PowerOff,
            Call::SdToHost,
            // done
            Call::CloseSerial,
            Call::PowerOff,
            Call::SdToHost,
        ]
    );
}

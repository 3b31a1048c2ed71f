/*!
 * Lifecycle Tests
 * Quit, crash, terminate, owner cascade, limits and the fatal halt path
 */

use crate::common::*;
use ntweb_kernel::subsystem::ntdll;
use ntweb_kernel::{
    CreateProcessInfo, ExitReason, ExternalHost, Kernel, KernelConfig, KernelError, Message, ObjectType,
    ProcessError, ProcessState, UserContext,
};
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

fn external_kernel(config: KernelConfig) -> (Kernel, ExternalHost) {
    let host = ExternalHost::new();
    let kernel = Kernel::builder()
        .with_config(config)
        .with_storage(storage_with_app())
        .with_host(host.clone())
        .build();
    (kernel, host)
}

#[tokio::test]
async fn test_quit_message_ends_process() {
    let (kernel, host) = external_kernel(KernelConfig::default());
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    assert_eq!(process.state(), ProcessState::Running);
    let mut port = host.take_port(process.id()).unwrap();
    expect_create(&mut port).await;

    let hooked = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&hooked);
    process.on_terminate(move |status| flag.store(status.code == 3, Ordering::SeqCst));

    port.send(Message::post("ntdll", ntdll::ops::QUIT, json!({ "code": 3 }))).unwrap();
    let status = wait_exit(&process).await;
    assert_eq!(status.reason, ExitReason::Quit);
    assert_eq!(status.code, 3);
    assert!(hooked.load(Ordering::SeqCst));
    assert!(kernel.get_process(process.id()).is_none());
    assert!(!kernel.objects().contains(process.handle()));
}

#[tokio::test]
async fn test_vanished_context_counts_as_crash() {
    let (kernel, host) = external_kernel(KernelConfig::default());
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    drop(host.take_port(process.id()));

    let status = wait_exit(&process).await;
    assert_eq!(status.reason, ExitReason::Crashed);
    assert!(!kernel.is_halted());
}

#[tokio::test]
async fn test_program_error_is_reported_as_crash() {
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_program("app", |_ctx: UserContext| async move {
            Err::<i32, _>(anyhow::anyhow!("disk on fire"))
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let status = wait_exit(&process).await;
    assert_eq!(status.reason, ExitReason::Crashed);
    assert!(status.error.unwrap_or_default().contains("disk on fire"));
}

#[tokio::test]
async fn test_program_exit_code_and_startup_info() {
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_program("app", move |ctx: UserContext| {
            let seen_tx = seen_tx.clone();
            async move {
                seen_tx.send((ctx.args().to_vec(), ctx.env_var("mode").map(str::to_string)))?;
                anyhow::Ok(17)
            }
        })
        .build();

    let info = CreateProcessInfo::new("app.exe")
        .with_command_line("app.exe --fast \"two words\"")
        .with_env("MODE", "test");
    let process = kernel.create_process(info).unwrap();

    let (args, mode) = seen.recv().await.unwrap();
    assert_eq!(args, vec!["app.exe", "--fast", "two words"]);
    assert_eq!(mode.as_deref(), Some("test"));
    let status = wait_exit(&process).await;
    assert_eq!(status.reason, ExitReason::Quit);
    assert_eq!(status.code, 17);
    assert_eq!(kernel.metrics().snapshot().processes_exited, 1);
}

#[tokio::test]
async fn test_kernel_quit_raises_flag_and_drains() {
    let (started_tx, mut started) = mpsc::unbounded_channel();
    let kernel = Kernel::builder()
        .with_storage(storage_with_app())
        .with_program("app", move |ctx: UserContext| {
            let started_tx = started_tx.clone();
            async move {
                started_tx.send(())?;
                while !ctx.quit_requested() {
                    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
                }
                anyhow::Ok(9)
            }
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    started.recv().await.unwrap();
    assert!(process.quit(0));
    let status = wait_exit(&process).await;
    assert_eq!(status.reason, ExitReason::Quit);
}

#[tokio::test]
async fn test_owner_cascade_takes_children_down() {
    let (kernel, host) = external_kernel(KernelConfig::default());
    let parent = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let child = kernel
        .create_process_owned(CreateProcessInfo::new("app.exe"), parent.handle())
        .unwrap();
    assert!(kernel.objects().is_owned_by(child.handle(), parent.handle()));
    let _ports = (host.take_port(parent.id()), host.take_port(child.id()));

    assert!(kernel.terminate_process(parent.id(), 1, None).unwrap());
    let status = wait_exit(&child).await;
    assert_eq!(status.reason, ExitReason::OwnerDestroyed);
    assert_eq!(wait_exit(&parent).await.reason, ExitReason::Terminated);
    assert_eq!(kernel.process_count(), 0);

    let err = kernel.terminate_process(parent.id(), 1, None).unwrap_err();
    assert!(matches!(err, KernelError::Process(ProcessError::NotFound(_))));
}

#[tokio::test]
async fn test_process_limit() {
    let (kernel, _host) = external_kernel(KernelConfig::default().with_max_processes(1));
    let _first = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let err = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap_err();
    assert!(matches!(
        err,
        KernelError::Process(ProcessError::LimitReached { current: 1, limit: 1 })
    ));
}

#[tokio::test]
async fn test_critical_process_death_halts_kernel() {
    let (kernel, host) = external_kernel(KernelConfig::default());
    let critical = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let bystander = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let _ports = (host.take_port(critical.id()), host.take_port(bystander.id()));

    let file = kernel.objects().set_object(1u8, ObjectType::FILE, critical.handle());
    let nested = kernel.objects().set_object(2u8, ObjectType::FILE, file);
    let unrelated = kernel.objects().set_object(3u8, ObjectType::FILE, bystander.handle());

    critical.set_critical(true);
    assert!(critical.terminate(1, Some("killed".into())).unwrap());

    assert!(kernel.is_halted());
    assert!(!kernel.objects().contains(file));
    assert!(!kernel.objects().contains(nested));
    assert!(!kernel.objects().contains(unrelated));
    assert!(kernel.objects().is_empty());
    assert_eq!(wait_exit(&bystander).await.reason, ExitReason::Halted);
    assert!(kernel.wait_for_halt().await.contains("killed"));

    let err = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap_err();
    assert!(matches!(err, KernelError::Process(ProcessError::SystemHalted(_))));
}

#[tokio::test]
async fn test_critical_process_quit_is_not_fatal() {
    let (kernel, host) = external_kernel(KernelConfig::default());
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    process.set_critical(true);
    let port = host.take_port(process.id()).unwrap();

    port.send(Message::post("ntdll", ntdll::ops::QUIT, json!({ "code": 0 }))).unwrap();
    assert_eq!(wait_exit(&process).await.reason, ExitReason::Quit);
    assert!(!kernel.is_halted());
}

#[tokio::test]
async fn test_shutdown_terminates_everything() {
    let (kernel, _host) = external_kernel(KernelConfig::default());
    let a = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let b = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    b.set_critical(true);
    assert_eq!(kernel.list_processes().len(), 2);

    kernel.shutdown();
    assert_eq!(wait_exit(&a).await.reason, ExitReason::Terminated);
    assert_eq!(wait_exit(&b).await.reason, ExitReason::Terminated);
    assert!(!kernel.is_halted());
    assert!(kernel.objects().is_empty());
}

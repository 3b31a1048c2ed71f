/*!
 * Shared fixtures for kernel tests
 */

#![allow(dead_code)]

use bytes::Bytes;
use ntweb_kernel::process::ExitStatus;
use ntweb_kernel::subsystem::ntdll;
use ntweb_kernel::{encode_image, Message, MessagePort, MemStorage, ModuleDescriptor, Process};
use std::time::Duration;

pub const SYSTEM_DIR: &str = "C:/Windows/System32";

pub fn exe(entry_point: &str) -> Bytes {
    encode_image(&ModuleDescriptor::executable(entry_point), b"").unwrap()
}

pub fn dll(name: &str) -> Bytes {
    encode_image(&ModuleDescriptor::library().with_name(name), name.as_bytes()).unwrap()
}

/// Storage with `app.exe` (entry `app`) in the system directory
pub fn storage_with_app() -> MemStorage {
    let storage = MemStorage::new();
    storage.insert(&format!("{}/app.exe", SYSTEM_DIR), exe("app"));
    storage
}

/// Receive the startup message every context gets first
pub async fn expect_create(port: &mut MessagePort) -> Message {
    let create = recv(port).await;
    assert_eq!(create.subsystem, "ntdll");
    assert_eq!(create.op, ntdll::ops::CREATE);
    create
}

pub async fn recv(port: &mut MessagePort) -> Message {
    tokio::time::timeout(Duration::from_secs(5), port.recv())
        .await
        .expect("no message within 5s")
        .expect("kernel closed the channel")
}

pub async fn wait_exit(process: &Process) -> ExitStatus {
    tokio::time::timeout(Duration::from_secs(5), process.wait())
        .await
        .expect("process did not exit within 5s")
}

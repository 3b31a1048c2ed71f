/*!
 * Loader Tests
 * Search order, the global module cache and per-process references
 */

use crate::common::*;
use ntweb_kernel::subsystem::ntdll;
use ntweb_kernel::{
    encode_image, CreateProcessInfo, ExternalHost, Handle, Kernel, KernelError, MemStorage, Message,
    ModuleDescriptor, ObjectType, ProcessError,
};
use pretty_assertions::assert_eq;
use serde_json::json;

fn kernel_with(storage: MemStorage) -> (Kernel, ExternalHost) {
    let host = ExternalHost::new();
    let kernel = Kernel::builder()
        .with_storage(storage)
        .with_host(host.clone())
        .build();
    (kernel, host)
}

#[tokio::test]
async fn test_system_dir_fallback_and_shared_cache() {
    let storage = MemStorage::new();
    storage.insert("C:/Apps/app.exe", exe("app"));
    storage.insert(&format!("{}/gdi32.dll", SYSTEM_DIR), dll("gdi32"));
    let (kernel, _host) = kernel_with(storage.clone());

    let first = kernel.create_process(CreateProcessInfo::new("C:/Apps/app.exe")).unwrap();
    let second = kernel.create_process(CreateProcessInfo::new("C:/Apps/app.exe")).unwrap();

    let a = kernel.loader().load_library(&first, "GDI32").unwrap();
    assert!(!a.handle.is_null());
    assert_eq!(a.path, "c:/windows/system32/gdi32.dll");
    let opens = storage.open_count();

    let b = kernel.loader().load_library(&second, "gdi32.dll").unwrap();
    assert_eq!(storage.open_count(), opens);
    assert_eq!(b.handle, a.handle);
    assert_eq!(b.entry_url, a.entry_url);
    assert_eq!(kernel.objects().ref_count(a.handle), Some(2));
    assert_eq!(kernel.objects().object_type(a.handle), Some(ObjectType::MODULE));
}

#[tokio::test]
async fn test_repeated_load_shares_one_module() {
    let storage = storage_with_app();
    storage.insert(&format!("{}/comctl32.dll", SYSTEM_DIR), dll("comctl32"));
    let (kernel, _host) = kernel_with(storage);
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let loader = kernel.loader();

    let one = loader.load_library(&process, "comctl32").unwrap();
    let two = loader.load_library(&process, "comctl32").unwrap();
    assert_eq!(one.handle, two.handle);
    assert_eq!(process.module("comctl32.dll").map(|m| m.refs), Some(2));

    assert!(loader.free_library(&process, "comctl32"));
    assert_eq!(loader.cached("comctl32"), Some(one.handle));
    assert!(kernel.objects().contains(one.handle));

    assert!(loader.free_library(&process, "comctl32"));
    assert_eq!(loader.cached("comctl32"), None);
    assert!(!kernel.objects().contains(one.handle));
    assert!(loader.blobs().resolve(&one.entry_url).is_none());
    assert!(!loader.free_library(&process, "comctl32"));
}

#[tokio::test]
async fn test_dependencies_load_first_and_missing_ones_fail() {
    let storage = storage_with_app();
    let shell = ModuleDescriptor::library().with_dependency("comctl32");
    storage.insert(&format!("{}/shell32.dll", SYSTEM_DIR), encode_image(&shell, b"").unwrap());
    storage.insert(&format!("{}/comctl32.dll", SYSTEM_DIR), dll("comctl32"));
    let broken = ModuleDescriptor::library().with_dependency("nowhere");
    storage.insert(&format!("{}/broken.dll", SYSTEM_DIR), encode_image(&broken, b"").unwrap());
    let (kernel, _host) = kernel_with(storage);
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();

    assert!(kernel.loader().load_library(&process, "shell32").is_some());
    assert!(process.module("comctl32.dll").is_some());

    assert!(kernel.loader().load_library(&process, "broken").is_none());
    assert!(kernel.loader().cached("broken").is_none());
    assert!(kernel.loader().load_library(&process, "missing").is_none());
}

#[tokio::test]
async fn test_cached_module_gives_each_process_its_dependencies() {
    let storage = MemStorage::new();
    let app = ModuleDescriptor::executable("app").with_dependency("gdi32");
    storage.insert(&format!("{}/app.exe", SYSTEM_DIR), encode_image(&app, b"").unwrap());
    storage.insert(&format!("{}/gdi32.dll", SYSTEM_DIR), dll("gdi32"));
    let (kernel, _host) = kernel_with(storage);

    let first = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let second = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    assert_eq!(first.module("gdi32.dll").map(|m| m.refs), Some(1));
    assert_eq!(second.module("gdi32.dll").map(|m| m.refs), Some(1));
    let gdi32 = kernel.loader().cached("gdi32").unwrap();
    assert_eq!(kernel.objects().ref_count(gdi32), Some(2));

    assert_eq!(first.terminate(0, None).unwrap(), true);
    assert!(second.module("gdi32.dll").is_some());
    assert_eq!(kernel.loader().cached("gdi32"), Some(gdi32));
    assert_eq!(kernel.objects().ref_count(gdi32), Some(1));

    assert_eq!(second.terminate(0, None).unwrap(), true);
    assert_eq!(kernel.loader().cached_count(), 0);
}

#[tokio::test]
async fn test_process_teardown_releases_modules() {
    let storage = storage_with_app();
    storage.insert(&format!("{}/gdi32.dll", SYSTEM_DIR), dll("gdi32"));
    let (kernel, _host) = kernel_with(storage);

    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let module = kernel.loader().load_library(&process, "gdi32").unwrap();
    assert_eq!(kernel.loader().cached_count(), 2);

    assert_eq!(process.terminate(0, None).unwrap(), true);
    assert!(!kernel.objects().contains(module.handle));
    assert_eq!(kernel.loader().cached_count(), 0);
    assert!(kernel.objects().is_empty());
}

#[tokio::test]
async fn test_load_library_over_the_wire() {
    let storage = storage_with_app();
    storage.insert(&format!("{}/gdi32.dll", SYSTEM_DIR), dll("gdi32"));
    let (kernel, host) = kernel_with(storage);
    let process = kernel.create_process(CreateProcessInfo::new("app.exe")).unwrap();
    let mut port = host.take_port(process.id()).unwrap();
    expect_create(&mut port).await;

    port.send(Message::request("ntdll", ntdll::ops::LOAD_LIBRARY, 1, json!({ "name": "gdi32" })))
        .unwrap();
    let reply = recv(&mut port).await;
    let handle: Handle = serde_json::from_value(reply.data["handle"].clone()).unwrap();
    assert!(!handle.is_null());

    port.send(Message::request("ntdll", ntdll::ops::LOAD_LIBRARY, 2, json!({ "name": "absent" })))
        .unwrap();
    assert_eq!(recv(&mut port).await.data, json!(null));

    port.send(Message::request("ntdll", ntdll::ops::CLOSE_HANDLE, 3, json!({ "handle": handle })))
        .unwrap();
    assert_eq!(recv(&mut port).await.data, json!(true));
    assert!(kernel.loader().cached("gdi32").is_none());
}

#[tokio::test]
async fn test_missing_or_library_executable_is_refused() {
    let storage = storage_with_app();
    storage.insert(&format!("{}/gdi32.dll", SYSTEM_DIR), dll("gdi32"));
    let (kernel, _host) = kernel_with(storage);

    let err = kernel.create_process(CreateProcessInfo::new("nope.exe")).unwrap_err();
    assert!(matches!(err, KernelError::Process(ProcessError::ExecutableNotFound(_))));

    let err = kernel.create_process(CreateProcessInfo::new("gdi32.dll")).unwrap_err();
    assert!(matches!(err, KernelError::Process(ProcessError::NotExecutable(_))));

    assert_eq!(kernel.process_count(), 0);
    assert_eq!(kernel.loader().cached_count(), 0);
    assert!(kernel.objects().is_empty());
}

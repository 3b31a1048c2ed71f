/*!
 * NtWeb Kernel - Main Entry Point
 *
 * Boots a kernel over in-memory module storage, starts one demo
 * executable and reports how it exited.
 */

use ntweb_kernel::{
    encode_image, init_tracing, CreateProcessInfo, ExportTable, Kernel, KernelConfig, MemStorage, ModuleDescriptor,
    SubsystemId, UserContext,
};
use serde_json::json;
use std::error::Error;
use tracing::info;

const GET_COMMAND_LINE: u32 = 1;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let config = KernelConfig::from_env()?;
    init_tracing(config.trace_json);

    info!("NtWeb kernel starting...");

    let storage = MemStorage::new();
    let exe = encode_image(
        &ModuleDescriptor::executable("hello").with_name("hello").with_version("1.0"),
        b"",
    )?;
    storage.insert(&format!("{}/hello.exe", config.system_dir), exe);

    let kernel32 = ExportTable::new(SubsystemId::Kernel32).export_sync(GET_COMMAND_LINE, |ctx, _payload| {
        Ok(json!(ctx.process().image().command_line))
    });

    let kernel = Kernel::builder()
        .with_config(config)
        .with_storage(storage)
        .with_subsystem(kernel32)
        .with_program("hello", |ctx: UserContext| async move {
            ctx.load_subsystem(SubsystemId::Kernel32).await?;
            let command_line = ctx.call(SubsystemId::Kernel32, GET_COMMAND_LINE, json!(null)).await?;
            info!(pid = ctx.process_id(), %command_line, "hello from user mode");
            let me = ctx.process_info(None).await?;
            info!(info = ?me.map(|p| p.name), "process info");
            anyhow::Ok(0)
        })
        .build();

    let process = kernel.create_process(CreateProcessInfo::new("hello.exe").with_command_line("hello.exe --demo"))?;
    let status = process.wait().await;
    info!(
        pid = process.id(),
        code = status.code,
        reason = ?status.reason,
        "Demo process finished"
    );

    info!(metrics = ?kernel.metrics().snapshot(), "Kernel metrics");
    kernel.shutdown();
    Ok(())
}

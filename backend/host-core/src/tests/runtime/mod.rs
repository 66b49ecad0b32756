mod ipc;
mod launch;

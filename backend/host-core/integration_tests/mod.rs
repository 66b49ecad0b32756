mod extension_runtime;
mod helpers;
mod management;
mod upgrade;

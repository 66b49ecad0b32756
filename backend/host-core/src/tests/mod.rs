mod channel;
mod runtime;
mod session;

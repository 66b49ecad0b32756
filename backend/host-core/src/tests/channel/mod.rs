mod persistent;
mod protocol;

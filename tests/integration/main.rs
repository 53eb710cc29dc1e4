mod common;
mod controller;
mod host;
mod storage;

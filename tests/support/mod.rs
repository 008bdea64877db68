#![allow(dead_code)]

pub mod bitcoind;
pub mod fakes;
pub mod fixtures;
pub mod poll;

#![forbid(unsafe_code)]

//! Runtime: observable values, distinct-until-changed holders, N-source merge
//! combinators, and list conveniences.

pub mod reactive;

//! Backend adapters
//!
//! One adapter per data store. The relational adapters share result folding
//! and cancel bookkeeping from [`common`].

pub mod common;
pub mod mongodb;
pub mod mysql;
pub mod postgres;
pub mod sqlite;

mod common;
mod item_store_tests;

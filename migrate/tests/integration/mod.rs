mod cleanup_test;
mod migration_test;
mod replication_test;
mod resume_test;

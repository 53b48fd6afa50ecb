//! Collaborators the archive pipeline consumes: object storage, the job
//! record store, and the dead-letter queue.

pub mod dead_letters;
pub mod job_store;
pub mod object_store;
pub mod storage_service;

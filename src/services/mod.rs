pub mod composer;
pub mod embedding_builder;
pub mod index_build;
pub mod index_store;
pub mod normalizer;
pub mod prompt;
pub mod providers;
pub mod recommendations;
pub mod retriever;
pub mod vector_index;

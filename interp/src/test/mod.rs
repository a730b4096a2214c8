pub mod helpers;

mod pipelines;

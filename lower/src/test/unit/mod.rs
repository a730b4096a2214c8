mod bounds;
mod concurrency;
mod nest;
mod partition;
mod sliding_fold;

mod compaction;
mod content;

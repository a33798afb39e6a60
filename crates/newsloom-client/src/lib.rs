pub mod adapters;
pub mod fetcher;
pub mod normalize;

pub use adapters::{ApiAdapter, FeedAdapter, HtmlAdapter, build_adapter, build_all};
pub use fetcher::ReqwestFetcher;
pub use normalize::{ArticleDraft, Normalizer};

//! Page rendering: layout descriptors in, single-page PDF bytes out.

mod html;
mod images;
mod page;

pub use html::page_markup;
pub use images::{HttpImageFetcher, ImageFetcher, ImageResolver, IPFS_SCHEME};
pub use page::PageRenderer;

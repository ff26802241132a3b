pub mod error;
pub mod handler;
pub mod image_transform;
pub mod input;
pub mod pdf_transform;
pub mod state;

pub use error::{IntakeError, MIB};
pub use handler::{FileIntakeHandler, HandlerConfig, TransformResult, PDF_SIZE_LIMIT};
pub use image_transform::{compress_image, ImageCompressor, ImageOptions, ImageTransform};
pub use input::{FileKind, InputFile};
pub use pdf_transform::{copy_pages, PdfRewriter, PdfTransform};
pub use state::{DownloadLink, IntakeState, SettlePolicy, Ticket, View, DOWNLOAD_FILENAME};

use wasm_bindgen::prelude::*;

/// Compresses an image or PDF handed over by the page. Returns `undefined` when the
/// declared type is neither.
#[wasm_bindgen]
pub fn compress_file(input: &[u8], mime_type: &str) -> Result<Option<Vec<u8>>, JsError> {
    // Initialize console_error_panic_hook for better error messages in browser console
    #[cfg(feature = "console_error_panic_hook")]
    console_error_panic_hook::set_once();

    let config = HandlerConfig {
        image: ImageOptions {
            use_background_thread: false,
            ..ImageOptions::default()
        },
        ..HandlerConfig::default()
    };
    let file = InputFile::from_bytes("upload", mime_type, input.to_vec());

    match FileIntakeHandler::new(config).compress_now(&file) {
        None => Ok(None),
        Some(Ok(bytes)) => Ok(Some(bytes)),
        Some(Err(err)) => {
            #[cfg(target_arch = "wasm32")]
            web_sys::console::error_1(&format!("{:?}", err).into());
            Err(JsError::new(&err.to_string()))
        }
    }
}

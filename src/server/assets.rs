// ABOUTME: Serves the embedded frontend bundle with content types by extension
// Unknown paths fall back to index.html so client-side routing keeps working

use axum::body::Body;
use axum::http::{header, HeaderValue, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use include_dir::{include_dir, Dir};

static PUBLIC: Dir<'static> = include_dir!("$CARGO_MANIFEST_DIR/public");

// 30 days, matching the hashed-filename lifetime of the bundle.
const ASSET_CACHE_CONTROL: &str = "public, max-age=2592000";

pub async fn serve(uri: Uri) -> Response {
    serve_path(uri.path())
}

pub(crate) fn serve_path(path: &str) -> Response {
    let trimmed = path.trim_start_matches('/');

    let (file, cacheable) = match PUBLIC.get_file(trimmed) {
        Some(file) => (file, trimmed.starts_with("assets/")),
        None => match PUBLIC.get_file("index.html") {
            Some(index) => (index, false),
            None => return StatusCode::NOT_FOUND.into_response(),
        },
    };

    let mime = mime_guess::from_path(file.path()).first_or(mime_guess::mime::TEXT_HTML);
    let mut response = Response::new(Body::from(file.contents()));
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime.essence_str())
            .unwrap_or_else(|_| HeaderValue::from_static("application/octet-stream")),
    );
    if cacheable {
        response.headers_mut().insert(
            header::CACHE_CONTROL,
            HeaderValue::from_static(ASSET_CACHE_CONTROL),
        );
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_paths_fall_back_to_index() {
        let response = serve_path("/deep/client/route");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers().get(header::CONTENT_TYPE).unwrap(),
            "text/html"
        );
        assert!(response.headers().get(header::CACHE_CONTROL).is_none());
    }

    #[test]
    fn index_is_served_at_the_root() {
        let response = serve_path("/");
        assert_eq!(response.status(), StatusCode::OK);
    }
}

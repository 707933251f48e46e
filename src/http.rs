//! Status page integration
//!
//! The daemon's HTTP server is an external collaborator; the pool only
//! contributes two page bodies, listing the active and the known tunnel
//! URLs as `<option>` elements for the daemon's configuration form. The
//! [`PageRegistry`] trait is the seam: the pool registers its handlers
//! against whatever server the daemon runs.

/// Page body generator
pub type PageHandler = Box<dyn Fn(&mut String) + Send + Sync>;

/// Registration surface offered by the daemon's HTTP server
pub trait PageRegistry {
    /// Register a handler for the named page
    fn register_page(&self, name: &str, handler: PageHandler);
}

/// Page name listing the active tunnels
pub const ACTIVE_PAGE: &str = "tunnels-active.html";

/// Page name listing every known tunnel
pub const ALL_PAGE: &str = "tunnels-all.html";

/// Append one `<option>` line per URL
pub(crate) fn render_options(out: &mut String, urls: impl Iterator<Item = String>) {
    for url in urls {
        out.push_str("<option value=\"");
        out.push_str(&url);
        out.push_str("\">");
        out.push_str(&url);
        out.push_str("</option>\n");
    }
}

//! `dlmgr register-extension <id>` — install the native-messaging manifests
//! (Chromium and Firefox families) and shim for a browser extension.

use anyhow::Result;
use dlmgr_core::ingress::native_messaging::{self, Browser};

pub fn run(extension_id: String, browser: String) -> Result<()> {
    // `browser` only validates the flag; both manifests are written
    // unconditionally since one shim install has to serve either browser.
    Browser::parse(&browser)?;
    let (chromium, firefox) = native_messaging::install(&extension_id)?;
    println!("wrote {}", chromium.display());
    println!("wrote {}", firefox.display());
    Ok(())
}

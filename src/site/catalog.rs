//! Data-driven adapters for the site family whose probes differ only in
//! host, request shape, and response predicates. One table entry per site
//! replaces a hand-written adapter; sites with genuinely unique flows
//! (qunar, jjgames) keep dedicated modules.

use crate::site::{
    classify_status, parse_object, random_user_agent, request_target, time_params, Outcome,
    RequestContext, Scheme, SiteAdapter, SiteRequest, Verdict,
};
use crate::transport::SiteResponse;
use bytes::Bytes;
use http_body_util::Full;

/// Request template. `{number}` and `{time}` are substituted in both the
/// path and the body; an empty body means a bodyless request.
pub struct RequestShape {
    pub method: &'static str,
    pub path: &'static str,
    pub body: &'static str,
    pub content_type: Option<&'static str>,
    pub referer: Option<&'static str>,
}

/// How the response body is read.
pub enum ResponseRule {
    /// JSON `{"success":bool,"Code":0|1}`; 0 means registered, 1 means free.
    /// `success:false` counts as Unknown; only an unparseable body is
    /// treated as proxy interference.
    CasinoCode,
    /// JSON object whose `field` is matched against marker substrings.
    MsgMarkers {
        field: &'static str,
        available: &'static [&'static str],
        registered: &'static [&'static str],
    },
    /// Raw-body substring probes, for sites whose responses are not reliably
    /// JSON.
    BodyMarkers {
        available: &'static [&'static str],
        registered: &'static [&'static str],
    },
}

pub struct CatalogSite {
    pub alias: &'static str,
    /// Substring of the control plane's website address that selects this
    /// entry.
    pub token: &'static str,
    pub host: &'static str,
    pub port: Option<u16>,
    pub scheme: Scheme,
    pub request: RequestShape,
    pub response: ResponseRule,
}

/// GET used by the casino storefront family.
const CHECK_DATA: RequestShape = RequestShape {
    method: "GET",
    path: "/Common/CheckData?DataType=telephone&DataContent={number}&_={time}",
    body: "",
    content_type: None,
    referer: None,
};

pub static CATALOG: &[CatalogSite] = &[
    CatalogSite {
        alias: "autohome",
        token: "autohome",
        host: "account.autohome.com.cn",
        port: None,
        scheme: Scheme::Https,
        request: RequestShape {
            method: "POST",
            path: "/AccountApi/CheckPhone",
            body: "isOverSea=0&phone={number}&validcodetype=1",
            content_type: Some("application/x-www-form-urlencoded; charset=UTF-8"),
            referer: Some("https://account.autohome.com.cn/register"),
        },
        // `MobileNotExist` must be probed before `MobileExist`: the former
        // contains the latter.
        response: ResponseRule::MsgMarkers {
            field: "Msg",
            available: &["MobileNotExist"],
            registered: &["MobileExist", "MobileSuccess"],
        },
    },
    CatalogSite {
        alias: "pc_auto",
        token: "pcauto",
        host: "passport3.pcauto.com.cn",
        port: None,
        scheme: Scheme::Https,
        request: RequestShape {
            method: "POST",
            path: "/passport3/api/validate_mobile.jsp?mobile={number}&req_enc=UTF-8",
            body: "{}",
            content_type: Some("application/x-www-form-urlencoded"),
            referer: Some("https://my.pcauto.com.cn/passport/mobileRegister.jsp"),
        },
        response: ResponseRule::BodyMarkers {
            available: &["\"desc\":\"OK\""],
            registered: &["\"status\":43"],
        },
    },
    CatalogSite {
        alias: "xpuji",
        token: "s32689",
        host: "s32689.net",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "sun_city",
        token: "2707000",
        host: "2707000.com",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "macau_baccarat",
        token: "55222077",
        host: "55222077.com",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "lisboa_macau",
        token: "yy99345",
        host: "yy99345.am",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "chinese_macau",
        token: "18850i",
        host: "18850i.com",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "digit_330397",
        token: "330397",
        host: "www.330397.com",
        port: None,
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "digit_818685",
        token: "818685",
        host: "818685.com",
        port: Some(8080),
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
    CatalogSite {
        alias: "digit_11333xpj",
        token: "11333xpj",
        host: "11333xpj.com",
        port: Some(8787),
        scheme: Scheme::Https,
        request: CHECK_DATA,
        response: ResponseRule::CasinoCode,
    },
];

pub fn find(address: &str) -> Option<&'static CatalogSite> {
    CATALOG.iter().find(|site| address.contains(site.token))
}

pub struct CatalogAdapter {
    site: &'static CatalogSite,
}

impl CatalogAdapter {
    pub fn new(site: &'static CatalogSite) -> Self {
        Self { site }
    }
}

fn fill_template(template: &str, number: &str, now_ms: u64) -> String {
    template
        .replace("{number}", number)
        .replace("{time}", &now_ms.to_string())
}

impl SiteAdapter for CatalogAdapter {
    fn alias(&self) -> &str {
        self.site.alias
    }

    fn host(&self) -> &str {
        self.site.host
    }

    fn scheme(&self) -> Scheme {
        self.site.scheme
    }

    fn port(&self) -> u16 {
        self.site
            .port
            .unwrap_or_else(|| self.site.scheme.default_port())
    }

    fn prepare_request(&self, number: &str, ctx: &RequestContext) -> SiteRequest {
        let shape = &self.site.request;
        let (now_ms, _) = time_params();
        let path = fill_template(shape.path, number, now_ms);
        let body = fill_template(shape.body, number, now_ms);

        let mut builder = http::Request::builder()
            .method(shape.method)
            .uri(request_target(self.scheme(), self.host(), &path, ctx))
            .header("host", self.host())
            .header("connection", "keep-alive")
            .header("accept", "application/json, text/javascript, */*; q=0.01")
            .header("x-requested-with", "XMLHttpRequest")
            .header("user-agent", random_user_agent());
        if let Some(content_type) = shape.content_type {
            builder = builder.header("content-type", content_type);
        }
        if let Some(referer) = shape.referer {
            builder = builder.header("referer", referer);
        }
        if let Some(auth) = &ctx.proxy_auth {
            builder = builder.header("proxy-authorization", auth.as_str());
        }
        builder
            .body(Full::new(Bytes::from(body)))
            .expect("static request parts are valid")
    }

    fn classify(&self, response: &SiteResponse) -> Verdict {
        if let Some(verdict) = classify_status(response.status) {
            return verdict;
        }
        match &self.site.response {
            ResponseRule::CasinoCode => {
                let Some(object) = parse_object(&response.body) else {
                    return Verdict::ProxyUnresponsive;
                };
                if object.get("success").and_then(|v| v.as_bool()) != Some(true) {
                    // A well-formed refusal is the site's answer for this
                    // number, not a broken endpoint.
                    return Verdict::classified(Outcome::Unknown);
                }
                match object.get("Code").and_then(|v| v.as_i64()) {
                    Some(0) => Verdict::classified(Outcome::Registered),
                    Some(1) => Verdict::classified(Outcome::NotRegistered),
                    _ => Verdict::classified(Outcome::Unknown),
                }
            }
            ResponseRule::MsgMarkers {
                field,
                available,
                registered,
            } => {
                let Some(object) = parse_object(&response.body) else {
                    return Verdict::classified(Outcome::Unknown);
                };
                let Some(msg) = object.get(*field).and_then(|v| v.as_str()) else {
                    return Verdict::classified(Outcome::Unknown);
                };
                match_markers(msg, available, registered)
            }
            ResponseRule::BodyMarkers {
                available,
                registered,
            } => match_markers(&response.body, available, registered),
        }
    }
}

fn match_markers(haystack: &str, available: &[&str], registered: &[&str]) -> Verdict {
    if available.iter().any(|marker| haystack.contains(marker)) {
        return Verdict::classified(Outcome::NotRegistered);
    }
    if registered.iter().any(|marker| haystack.contains(marker)) {
        return Verdict::classified(Outcome::Registered);
    }
    Verdict::classified(Outcome::Unknown)
}

use crate::site::{
    classify_status, parse_object, random_user_agent, request_target, Outcome, RequestContext,
    Scheme, SiteAdapter, SiteRequest, Verdict,
};
use crate::transport::SiteResponse;
use bytes::Bytes;
use http_body_util::Full;

/// Registration validator on user.qunar.com. The endpoint answers with an
/// `errCode` that distinguishes free numbers, taken numbers, and throttled
/// source IPs.
pub struct Qunar;

const ERR_THROTTLED: i64 = 21017;
const ERR_NOT_REGISTERED: i64 = 21006;
const ERR_REGISTERED: i64 = 11009;

impl SiteAdapter for Qunar {
    fn alias(&self) -> &str {
        "qunar"
    }

    fn host(&self) -> &str {
        "user.qunar.com"
    }

    fn scheme(&self) -> Scheme {
        Scheme::Https
    }

    fn prepare_request(&self, number: &str, ctx: &RequestContext) -> SiteRequest {
        let target = request_target(self.scheme(), self.host(), "/ajax/validator.jsp", ctx);
        let body = format!("method={}&prenum=86&vcode=null", number);

        let mut builder = http::Request::builder()
            .method("POST")
            .uri(target)
            .header("host", self.host())
            .header("connection", "keep-alive")
            .header("cache-control", "no-cache")
            .header("user-agent", random_user_agent())
            .header("accept", "application/json, text/javascript, */*; q=0.01")
            .header(
                "referer",
                "https://user.qunar.com/passport/register.jsp?ret=https%3A%2F%2Fwww.qunar.com%2F",
            )
            .header("x-requested-with", "XMLHttpRequest")
            .header(
                "content-type",
                "application/x-www-form-urlencoded; charset=UTF-8",
            )
            .header("content-length", body.len());
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
        let Some(object) = parse_object(&response.body) else {
            return Verdict::classified(Outcome::Unknown);
        };
        match object.get("errCode").and_then(|v| v.as_i64()) {
            Some(ERR_THROTTLED) => Verdict::ProxyWait,
            Some(ERR_NOT_REGISTERED) => Verdict::classified(Outcome::NotRegistered),
            Some(ERR_REGISTERED) => Verdict::classified(Outcome::Registered),
            _ => Verdict::classified(Outcome::Unknown),
        }
    }
}

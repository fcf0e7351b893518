use crate::site::{
    classify_status, parse_object, random_user_agent, request_target, time_params, Outcome,
    RequestContext, Scheme, SiteAdapter, SiteRequest, Verdict,
};
use crate::transport::SiteResponse;
use bytes::Bytes;
use http_body_util::Full;

/// Login-name availability check on the JJ games registration flow. The
/// endpoint is JSONP and reports its verdict as URL-encoded phrases inside
/// the `MSG` field.
pub struct JjGames;

/// "该手机号已注册，请更换" (already registered, use another).
const MSG_REGISTERED: &str =
    "%E8%AF%A5%E6%89%8B%E6%9C%BA%E5%8F%B7%E5%B7%B2%E6%B3%A8%E5%86%8C%EF%BC%8C%E8%AF%B7%E6%9B%B4%E6%8D%A2";
/// "帐户可以使用" (account available).
const MSG_AVAILABLE: &str = "%E5%B8%90%E6%88%B7%E5%8F%AF%E4%BB%A5%E4%BD%BF%E7%94%A8";
/// Throttle phrases: "操作异常/访问异常，请稍后重试" and "登录名非法".
const MSG_BLOCKED: [&str; 3] = [
    "%E6%93%8D%E4%BD%9C%E5%BC%82%E5%B8%B8%EF%BC%8C%E8%AF%B7%E7%A8%8D%E5%90%8E%E9%87%8D%E8%AF%95",
    "%E8%AE%BF%E9%97%AE%E5%BC%82%E5%B8%B8%EF%BC%8C%E8%AF%B7%E7%A8%8D%E5%90%8E%E5%86%8D%E8%AF%95",
    "%E7%99%BB%E5%BD%95%E5%90%8D%E9%9D%9E%E6%B3%95",
];

impl SiteAdapter for JjGames {
    fn alias(&self) -> &str {
        "jjgames"
    }

    fn host(&self) -> &str {
        "a4.srv.jj.cn"
    }

    fn scheme(&self) -> Scheme {
        Scheme::Https
    }

    fn prepare_request(&self, number: &str, ctx: &RequestContext) -> SiteRequest {
        let (now_ms, callback) = time_params();
        let path = format!(
            "/reg/check_loginname.php?regtype=2&t={}&n=1&loginname={}&callback=JSONP_{}",
            now_ms, number, callback
        );
        let target = request_target(self.scheme(), self.host(), &path, ctx);
        let cookie = format!("visitorId=4460870697_{}", now_ms);

        let mut builder = http::Request::builder()
            .method("GET")
            .uri(target)
            .header("host", self.host())
            .header("user-agent", random_user_agent())
            .header("accept", "*/*")
            .header("referer", "https://www.jj.cn/reg/reg.html?type=phone")
            .header("sec-fetch-dest", "script")
            .header("sec-fetch-site", "same-site")
            .header("sec-fetch-mode", "no-cors")
            .header("accept-language", "en-US,en;q=0.5")
            .header("cache-control", "no-cache")
            .header("cookie", cookie);
        if let Some(auth) = &ctx.proxy_auth {
            builder = builder.header("proxy-authorization", auth.as_str());
        }
        builder
            .body(Full::new(Bytes::new()))
            .expect("static request parts are valid")
    }

    fn classify(&self, response: &SiteResponse) -> Verdict {
        if let Some(verdict) = classify_status(response.status) {
            return verdict;
        }
        let Some(object) = parse_object(&response.body) else {
            return Verdict::classified(Outcome::Unknown);
        };
        let Some(msg) = object.get("MSG").and_then(|v| v.as_str()) else {
            return Verdict::classified(Outcome::Unknown);
        };
        if msg.contains(MSG_AVAILABLE) {
            return Verdict::Classified {
                outcome: Outcome::NotRegistered,
                evidence: Some(msg.to_string()),
            };
        }
        if msg.contains(MSG_REGISTERED) {
            return Verdict::classified(Outcome::Registered);
        }
        if MSG_BLOCKED.iter().any(|phrase| msg.contains(phrase)) {
            return Verdict::ProxyBlocked;
        }
        Verdict::classified(Outcome::Unknown)
    }
}
